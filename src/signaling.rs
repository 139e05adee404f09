use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Participant id assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Named relay events. Each frame on the wire is `{"event": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    /// `(room_name, display_name)`
    #[serde(rename = "readyForStream")]
    ReadyForStream(String, String),
    #[serde(rename = "readyForStreamSuccess")]
    ReadyForStreamSuccess {
        #[serde(rename = "roomName")]
        room_name: String,
    },
    #[serde(rename = "join_room")]
    JoinRoom(String),
    #[serde(rename = "leave_room")]
    LeaveRoom(String),
    #[serde(rename = "user_join")]
    UserJoin {
        #[serde(default)]
        sid: Option<PeerId>,
        #[serde(rename = "userName", default)]
        user_name: String,
    },
    #[serde(rename = "user_leave")]
    UserLeave { sid: PeerId },
    #[serde(rename = "user-list")]
    UserList {
        my_id: PeerId,
        #[serde(default)]
        list: Option<BTreeMap<PeerId, String>>,
    },
    #[serde(rename = "message")]
    Message(NegotiationMessage),
}

impl SignalingMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingMessage::ReadyForStream(..) => "readyForStream",
            SignalingMessage::ReadyForStreamSuccess { .. } => "readyForStreamSuccess",
            SignalingMessage::JoinRoom(_) => "join_room",
            SignalingMessage::LeaveRoom(_) => "leave_room",
            SignalingMessage::UserJoin { .. } => "user_join",
            SignalingMessage::UserLeave { .. } => "user_leave",
            SignalingMessage::UserList { .. } => "user-list",
            SignalingMessage::Message(_) => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for NegotiationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationKind::Offer => write!(f, "offer"),
            NegotiationKind::Answer => write!(f, "answer"),
            NegotiationKind::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NegotiationPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub sender_id: PeerId,
    pub target_id: PeerId,
    #[serde(flatten)]
    pub payload: NegotiationPayload,
}

impl NegotiationMessage {
    pub fn new(sender_id: PeerId, target_id: PeerId, payload: NegotiationPayload) -> Self {
        Self {
            sender_id,
            target_id,
            payload,
        }
    }

    pub fn kind(&self) -> NegotiationKind {
        match self.payload {
            NegotiationPayload::Offer { .. } => NegotiationKind::Offer,
            NegotiationPayload::Answer { .. } => NegotiationKind::Answer,
            NegotiationPayload::IceCandidate { .. } => NegotiationKind::IceCandidate,
        }
    }
}

/// Outbound half of the relay. Cheap to clone and usable from synchronous
/// connection callbacks.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl RelaySender {
    pub fn new(tx: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self { tx }
    }

    /// A sender paired with the receiver that observes everything it emits.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, msg: SignalingMessage) -> Result<()> {
        debug!(event = msg.event_name(), "relay emit");
        self.tx.send(msg).map_err(|_| Error::RelayDisconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Websocket connection to the relay.
pub struct SignalingClient {
    tx: RelaySender,
    rx: mpsc::Receiver<SignalingMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(%url, "connected to relay");
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, event = msg.event_name(), "failed to encode relay frame");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(json)).await {
                    warn!(error = %err, "relay write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(error = %err, "relay read failed");
                        break;
                    }
                };
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "ignoring unrecognised relay frame"),
                }
            }
            info!("relay stream closed");
        });

        Ok(Self {
            tx: RelaySender::new(outgoing_tx),
            rx,
        })
    }

    pub fn sender(&self) -> RelaySender {
        self.tx.clone()
    }

    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx.emit(msg)
    }

    pub async fn receive(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn split(self) -> (RelaySender, mpsc::Receiver<SignalingMessage>) {
        (self.tx, self.rx)
    }
}
