use std::env;
use std::time::Duration;

use crate::media::MediaConstraints;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    /// Handed unchanged to every new connection.
    pub ice_servers: Vec<String>,
    pub media: MediaConstraints,
    /// An invite with no answer after this long is marked failed.
    pub invite_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay_url = env::var("RELAY_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.relay_url);
        let ice_servers = env::var("ICE_SERVERS")
            .ok()
            .map(|value| parse_list(&value))
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);
        let invite_timeout = env::var("INVITE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(timeout_from_secs)
            .unwrap_or(defaults.invite_timeout);

        Self {
            relay_url,
            ice_servers,
            media: defaults.media,
            invite_timeout,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_owned()],
            media: MediaConstraints::default(),
            invite_timeout: Some(Duration::from_secs(DEFAULT_INVITE_TIMEOUT_SECS)),
        }
    }
}

/// `0` disables the timeout.
pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
