//! Peer-connection lifecycle and signaling for multi-party rooms.
//!
//! A [`RoomSession`] joins a room through a relay, keeps one connection per
//! remote participant and routes negotiation messages to them.

pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod media;
pub mod memory;
pub mod registry;
pub mod router;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod sink;

pub use config::SessionConfig;
pub use connection::{
    ConnectionHandle, ConnectionMonitor, ConnectionState, Connector, PeerConnection,
};
pub use error::{Error, Result};
pub use media::{LocalMediaHandle, MediaConstraints, MediaKind, MediaSource, TrackMediaSource};
pub use registry::{PeerRegistry, PeerSnapshot};
pub use rtc::RtcConnector;
pub use session::{Collaborators, RoomSession, SessionCommand, SessionState};
pub use signaling::{PeerId, RelaySender, SignalingClient, SignalingMessage};
pub use sink::{LogSink, VideoSink};
