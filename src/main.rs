use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use room_rtc::config::{timeout_from_secs, SessionConfig};
use room_rtc::media::{MediaKind, TrackMediaSource};
use room_rtc::session::{Collaborators, RoomSession, SessionCommand};
use room_rtc::{Error, LogSink, RtcConnector, SignalingClient};

#[derive(Parser, Debug)]
#[command(name = "room-rtc")]
#[command(about = "Join a relay room and hold one WebRTC connection per participant")]
struct Cli {
    /// Relay websocket URL
    #[arg(long, env = "RELAY_URL")]
    relay_url: Option<String>,

    #[arg(short, long)]
    room: String,

    /// Display name shown to other participants
    #[arg(short, long)]
    name: Option<String>,

    /// STUN/TURN server, repeatable or comma separated
    #[arg(long = "ice-server", value_delimiter = ',')]
    ice_servers: Vec<String>,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    no_video: bool,

    /// Seconds before an unanswered invite is marked failed, 0 disables
    #[arg(long)]
    invite_timeout_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> (SessionConfig, String, String) {
        let mut config = SessionConfig::from_env();
        if let Some(url) = self.relay_url {
            config.relay_url = url;
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        config.media.audio = !self.no_audio;
        if self.no_video {
            config.media.video = None;
        }
        if let Some(secs) = self.invite_timeout_secs {
            config.invite_timeout = timeout_from_secs(secs);
        }
        let name = self
            .name
            .unwrap_or_else(|| format!("user-{}", rand::random::<u16>()));
        (config, self.room, name)
    }
}

/// `audio off`, `video on`, `leave`, ...
fn parse_command(line: &str) -> Option<SessionCommand> {
    let mut words = line.split_whitespace();
    let command = match (words.next()?, words.next()) {
        ("leave", None) => SessionCommand::Leave,
        ("audio", Some(toggle)) => SessionCommand::SetTrackEnabled {
            kind: MediaKind::Audio,
            enabled: parse_toggle(toggle)?,
        },
        ("video", Some(toggle)) => SessionCommand::SetTrackEnabled {
            kind: MediaKind::Video,
            enabled: parse_toggle(toggle)?,
        },
        _ => return None,
    };
    Some(command)
}

fn parse_toggle(word: &str) -> Option<bool> {
    match word {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("room_rtc=info")),
        )
        .init();

    let (config, room, name) = Cli::parse().into_config();

    let client = SignalingClient::connect(&config.relay_url)
        .await
        .with_context(|| format!("failed to connect to relay at {}", config.relay_url))?;
    let (relay, inbound) = client.split();

    let collaborators = Collaborators {
        connector: Arc::new(RtcConnector::new().context("failed to set up WebRTC")?),
        media: Arc::new(TrackMediaSource::new()),
        sink: Arc::new(LogSink::new()),
    };
    let session = RoomSession::new(config, relay, collaborators);

    let (commands, command_rx) = mpsc::channel(16);
    commands
        .send(SessionCommand::Join {
            room_name: room,
            display_name: name,
        })
        .await
        .context("session command channel closed")?;

    // Weak so that dropping `commands` on ctrl-c ends the session.
    let stdin_commands = commands.downgrade();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(command) = parse_command(&line) else {
                warn!(%line, "unknown command");
                continue;
            };
            let Some(sender) = stdin_commands.upgrade() else {
                break;
            };
            if sender.send(command).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, leaving room");
            let _ = commands.send(SessionCommand::Leave).await;
        }
    });

    match session.run(inbound, command_rx).await {
        Ok(()) => Ok(()),
        Err(Error::RelayDisconnected) => {
            info!("relay closed the connection");
            Ok(())
        }
        Err(err) => Err(err).context("session failed"),
    }
}
