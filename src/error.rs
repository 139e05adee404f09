use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    /// Capture device denied or missing. Fatal to the current join attempt.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("refusing to connect to own peer id")]
    SelfConnectionAttempt,

    #[error("peer already has a connection")]
    DuplicateConnection,

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("peer {0} not found")]
    NotFound(String),

    #[error("peer {0} is already connected")]
    AlreadyConnected(String),

    #[error("session has not joined a room")]
    NotJoined,

    #[error("relay disconnected")]
    RelayDisconnected,

    /// The connection was released before the invite finished.
    #[error("invite to {0} cancelled")]
    InviteCancelled(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Benign races that are logged and otherwise ignored.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::DuplicateConnection | Error::InviteCancelled(_) | Error::UnknownPeer(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
