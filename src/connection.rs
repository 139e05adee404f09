use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidate, PeerId};

/// Lifecycle of one peer connection as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Inviting,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Inviting => write!(f, "Inviting"),
            ConnectionState::Answering => write!(f, "Answering"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// State reported by the negotiation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub transport: TransportState,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::New,
            transport: TransportState::New,
            last_error: None,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.receiver.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            // Closed is terminal.
            if status.state != ConnectionState::Closed {
                status.state = state;
            }
        });
    }

    pub fn update_transport_state(&self, transport: TransportState) {
        self.status.send_modify(|status| {
            status.transport = transport;
            if status.state == ConnectionState::Closed {
                return;
            }
            status.state = match transport {
                TransportState::Connected => ConnectionState::Connected,
                TransportState::Disconnected => ConnectionState::Disconnected,
                TransportState::Failed => ConnectionState::Failed,
                TransportState::Closed => ConnectionState::Closed,
                TransportState::New | TransportState::Connecting => status.state,
            };
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            if status.state != ConnectionState::Closed {
                status.state = ConnectionState::Failed;
            }
        });
    }

    /// Marks a still-pending invite as failed. Returns whether it did.
    pub fn expire_invite(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.state != ConnectionState::Inviting {
                return false;
            }
            status.state = ConnectionState::Failed;
            status.last_error = Some("invite timed out".to_owned());
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

pub type CandidateHook = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type TrackHook = Box<dyn Fn(RemoteTrack) + Send + Sync>;
pub type StateHook = Box<dyn Fn(TransportState) + Send + Sync>;

/// One negotiation session with a remote peer. Implementations own the
/// actual media transport; candidate ordering relative to descriptions is
/// handled internally.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn on_local_candidate(&self, hook: CandidateHook);
    fn on_remote_track(&self, hook: TrackHook);
    fn on_state_change(&self, hook: StateHook);

    async fn add_track(&self, track: &LocalTrack, enabled: bool) -> Result<()>;

    /// Creates an offer, applies it locally and returns its SDP.
    async fn create_offer(&self) -> Result<String>;

    /// Applies a remote offer and returns the SDP of the local answer.
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    async fn accept_answer(&self, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds peer connections against a fixed ICE server list.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>>;
}

enum GateState {
    Pending(Vec<IceCandidate>),
    Open,
    Released,
}

/// Holds local candidates until the description they belong to has been
/// sent, and swallows everything once the handle is released.
struct CandidateGate {
    state: Mutex<GateState>,
    emit: Box<dyn Fn(IceCandidate) + Send + Sync>,
}

impl CandidateGate {
    fn push(&self, candidate: IceCandidate) {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Pending(buffer) => buffer.push(candidate),
            GateState::Open => (self.emit)(candidate),
            GateState::Released => {}
        }
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if let GateState::Pending(buffer) = &mut *state {
            let buffered = std::mem::take(buffer);
            *state = GateState::Open;
            for candidate in buffered {
                (self.emit)(candidate);
            }
        }
    }

    /// Sends the description through `send`, then flushes buffered
    /// candidates. Returns false without sending if released.
    fn open_with(&self, send: impl FnOnce() -> Result<()>) -> Result<bool> {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Released => Ok(false),
            GateState::Open => {
                send()?;
                Ok(true)
            }
            GateState::Pending(buffer) => {
                send()?;
                let buffered = std::mem::take(buffer);
                *state = GateState::Open;
                for candidate in buffered {
                    (self.emit)(candidate);
                }
                Ok(true)
            }
        }
    }

    fn release(&self) -> bool {
        let mut state = self.state.lock();
        !matches!(std::mem::replace(&mut *state, GateState::Released), GateState::Released)
    }

    fn is_released(&self) -> bool {
        matches!(*self.state.lock(), GateState::Released)
    }
}

/// Session-side view of one peer connection. Clones refer to the same
/// connection; the registry entry holding it is the owner.
#[derive(Clone)]
pub struct ConnectionHandle {
    peer_id: PeerId,
    connection: Arc<dyn PeerConnection>,
    gate: Arc<CandidateGate>,
    monitor: ConnectionMonitor,
}

impl ConnectionHandle {
    /// `emit` receives local candidates once the gate is open.
    pub fn new(
        peer_id: PeerId,
        connection: Arc<dyn PeerConnection>,
        emit: impl Fn(IceCandidate) + Send + Sync + 'static,
    ) -> Self {
        Self {
            peer_id,
            connection,
            gate: Arc::new(CandidateGate {
                state: Mutex::new(GateState::Pending(Vec::new())),
                emit: Box::new(emit),
            }),
            monitor: ConnectionMonitor::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// Same underlying connection.
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.gate, &other.gate)
    }

    /// Hook suitable for `PeerConnection::on_local_candidate`. It holds only
    /// the gate, never the connection itself.
    pub fn candidate_sink(&self) -> impl Fn(IceCandidate) + Send + Sync + 'static {
        let gate = self.gate.clone();
        move |candidate| gate.push(candidate)
    }

    pub fn open_candidates(&self) {
        self.gate.open();
    }

    /// Emits a local description and then any candidates gathered for it, in
    /// one step with respect to `release`. Returns false if the handle was
    /// released and nothing was sent.
    pub fn send_description(&self, send: impl FnOnce() -> Result<()>) -> Result<bool> {
        self.gate.open_with(send)
    }

    pub fn is_released(&self) -> bool {
        self.gate.is_released()
    }

    /// Stops all outbound traffic for this peer and closes the backend
    /// connection. Only the first call does anything.
    pub async fn release(&self) {
        if !self.gate.release() {
            return;
        }
        debug!(peer = %self.peer_id, "releasing connection");
        self.monitor.update_state(ConnectionState::Closed);
        if let Err(err) = self.connection.close().await {
            warn!(peer = %self.peer_id, error = %err, "error closing connection");
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    fn gate() -> (CandidateGate, Arc<Mutex<Vec<IceCandidate>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let gate = CandidateGate {
            state: Mutex::new(GateState::Pending(Vec::new())),
            emit: Box::new(move |c| sink.lock().push(c)),
        };
        (gate, sent)
    }

    #[test]
    fn gate_buffers_until_open_then_passes_through() {
        let (gate, sent) = gate();
        gate.push(candidate(1));
        gate.push(candidate(2));
        assert!(sent.lock().is_empty());

        gate.open();
        gate.push(candidate(3));
        assert_eq!(*sent.lock(), vec![candidate(1), candidate(2), candidate(3)]);
    }

    #[test]
    fn description_goes_out_before_buffered_candidates() {
        let (gate, sent) = gate();
        gate.push(candidate(1));
        let order = sent.clone();
        let opened = gate
            .open_with(|| {
                assert!(order.lock().is_empty());
                Ok(())
            })
            .unwrap();
        assert!(opened);
        assert_eq!(*sent.lock(), vec![candidate(1)]);
    }

    #[test]
    fn failed_description_keeps_candidates_buffered() {
        let (gate, sent) = gate();
        gate.push(candidate(1));
        assert!(gate
            .open_with(|| Err(crate::error::Error::RelayDisconnected))
            .is_err());
        assert!(sent.lock().is_empty());
        assert!(matches!(*gate.state.lock(), GateState::Pending(ref b) if b.len() == 1));
    }

    #[test]
    fn released_gate_drops_everything() {
        let (gate, sent) = gate();
        gate.push(candidate(1));
        assert!(gate.release());
        gate.open();
        gate.push(candidate(2));
        assert!(!gate.open_with(|| panic!("released gate must not send")).unwrap());
        assert!(sent.lock().is_empty());
        assert!(!gate.release());
    }

    #[test]
    fn monitor_tracks_transport_and_keeps_closed_terminal() {
        let monitor = ConnectionMonitor::new();
        monitor.update_state(ConnectionState::Inviting);
        monitor.update_transport_state(TransportState::Connecting);
        assert_eq!(monitor.state(), ConnectionState::Inviting);

        monitor.update_transport_state(TransportState::Connected);
        assert_eq!(monitor.state(), ConnectionState::Connected);

        monitor.update_state(ConnectionState::Closed);
        monitor.update_transport_state(TransportState::Connected);
        assert_eq!(monitor.state(), ConnectionState::Closed);
    }

    #[test]
    fn expire_invite_only_hits_pending_invites() {
        let monitor = ConnectionMonitor::new();
        monitor.update_state(ConnectionState::Inviting);
        assert!(monitor.expire_invite());
        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert_eq!(monitor.status().last_error.as_deref(), Some("invite timed out"));

        let connected = ConnectionMonitor::new();
        connected.update_state(ConnectionState::Connected);
        assert!(!connected.expire_invite());
        assert_eq!(connected.state(), ConnectionState::Connected);
    }
}
