//! In-process negotiation backend.
//!
//! Every call made against a [`MemoryPeerConnection`] is recorded, so tests
//! can assert on ordering without a network. Two memory connections complete
//! a handshake when the offer/answer SDP produced by one is fed to the other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::connection::{
    CandidateHook, Connector, PeerConnection, StateHook, TrackHook, TransportState,
};
use crate::error::{Error, Result};
use crate::media::{
    LocalMediaHandle, LocalTrack, MediaConstraints, MediaKind, MediaSource, RemoteTrack,
    TrackMediaSource,
};
use crate::signaling::{IceCandidate, PeerId};
use crate::sink::{SinkHandle, VideoSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    CandidateHookSet,
    TrackHookSet,
    StateHookSet,
    TrackAttached { kind: MediaKind, enabled: bool },
    OfferCreated,
    OfferAccepted,
    AnswerAccepted,
    CandidateAdded(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
}

type CandidateFn = Arc<dyn Fn(IceCandidate) + Send + Sync>;
type TrackFn = Arc<dyn Fn(RemoteTrack) + Send + Sync>;
type StateFn = Arc<dyn Fn(TransportState) + Send + Sync>;

pub struct MemoryPeerConnection {
    id: u64,
    ice_servers: Vec<String>,
    events: Mutex<Vec<BackendEvent>>,
    candidate_hook: Mutex<Option<CandidateFn>>,
    track_hook: Mutex<Option<TrackFn>>,
    state_hook: Mutex<Option<StateFn>>,
    local_kinds: Mutex<Vec<MediaKind>>,
    signaling: Mutex<Signaling>,
    closed: AtomicBool,
    fail_offers: bool,
    offer_gate: Option<Arc<Notify>>,
}

impl MemoryPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Simulates a late candidate from the ICE agent.
    pub fn emit_candidate(&self, candidate: &str) {
        let hook = self.candidate_hook.lock().clone();
        if let Some(hook) = hook {
            hook(IceCandidate {
                candidate: candidate.to_owned(),
                sdp_mid: Some("0".to_owned()),
                sdp_mline_index: Some(0),
            });
        }
    }

    pub fn set_transport_state(&self, state: TransportState) {
        let hook = self.state_hook.lock().clone();
        if let Some(hook) = hook {
            hook(state);
        }
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Negotiation("connection closed".to_owned()));
        }
        Ok(())
    }

    fn describe(&self, role: &str) -> String {
        let kinds: Vec<String> = self.local_kinds.lock().iter().map(|k| k.to_string()).collect();
        format!("memory {role} {} {}", self.id, kinds.join(","))
    }

    fn local_candidate(&self) {
        self.emit_candidate(&format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host",
            self.id,
            self.id % 250 + 1
        ));
    }

    fn deliver_remote_tracks(&self, sdp: &str) -> Result<()> {
        let mut fields = sdp.split(' ');
        if fields.next() != Some("memory") {
            return Err(Error::Negotiation(format!("unsupported description: {sdp}")));
        }
        let _role = fields.next();
        let remote_id = fields.next().unwrap_or_default();
        let kinds = fields.next().unwrap_or_default();
        let hook = self.track_hook.lock().clone();
        for kind in kinds.split(',').filter(|k| !k.is_empty()) {
            let kind = match kind {
                "audio" => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            if let Some(hook) = &hook {
                hook(RemoteTrack::new(
                    format!("{kind}-{remote_id}"),
                    format!("stream-{remote_id}"),
                    kind,
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    fn on_local_candidate(&self, hook: CandidateHook) {
        self.record(BackendEvent::CandidateHookSet);
        *self.candidate_hook.lock() = Some(Arc::from(hook));
    }

    fn on_remote_track(&self, hook: TrackHook) {
        self.record(BackendEvent::TrackHookSet);
        *self.track_hook.lock() = Some(Arc::from(hook));
    }

    fn on_state_change(&self, hook: StateHook) {
        self.record(BackendEvent::StateHookSet);
        *self.state_hook.lock() = Some(Arc::from(hook));
    }

    async fn add_track(&self, track: &LocalTrack, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.record(BackendEvent::TrackAttached {
            kind: track.kind(),
            enabled,
        });
        self.local_kinds.lock().push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        self.record(BackendEvent::OfferCreated);
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        self.ensure_open()?;
        if self.fail_offers {
            return Err(Error::Negotiation("offer rejected by backend".to_owned()));
        }
        *self.signaling.lock() = Signaling::HaveLocalOffer;
        self.set_transport_state(TransportState::Connecting);
        self.local_candidate();
        Ok(self.describe("offer"))
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        self.record(BackendEvent::OfferAccepted);
        self.ensure_open()?;
        self.deliver_remote_tracks(&sdp)?;
        *self.signaling.lock() = Signaling::Stable;
        let answer = self.describe("answer");
        self.local_candidate();
        self.set_transport_state(TransportState::Connected);
        Ok(answer)
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        self.record(BackendEvent::AnswerAccepted);
        self.ensure_open()?;
        if *self.signaling.lock() != Signaling::HaveLocalOffer {
            return Err(Error::Negotiation("answer without local offer".to_owned()));
        }
        self.deliver_remote_tracks(&sdp)?;
        *self.signaling.lock() = Signaling::Stable;
        self.set_transport_state(TransportState::Connected);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        self.record(BackendEvent::CandidateAdded(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.record(BackendEvent::Closed);
        self.set_transport_state(TransportState::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryConnector {
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<MemoryPeerConnection>>>,
    fail_offers: AtomicBool,
    offer_gate: Mutex<Option<Arc<Notify>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MemoryPeerConnection>> {
        self.connections.lock().clone()
    }

    /// Connections created from now on fail when asked for an offer.
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::Release);
    }

    /// Connections created from now on block in `create_offer` until the
    /// returned `Notify` is signalled.
    pub fn hold_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(MemoryPeerConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            ice_servers: ice_servers.to_vec(),
            events: Mutex::new(Vec::new()),
            candidate_hook: Mutex::new(None),
            track_hook: Mutex::new(None),
            state_hook: Mutex::new(None),
            local_kinds: Mutex::new(Vec::new()),
            signaling: Mutex::new(Signaling::Stable),
            closed: AtomicBool::new(false),
            fail_offers: self.fail_offers.load(Ordering::Acquire),
            offer_gate: self.offer_gate.lock().clone(),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection as Arc<dyn PeerConnection>)
    }
}

/// Media source whose device can be switched off.
pub struct MemoryMediaSource {
    tracks: TrackMediaSource,
    available: AtomicBool,
    acquisitions: AtomicUsize,
}

impl MemoryMediaSource {
    pub fn new() -> Self {
        Self {
            tracks: TrackMediaSource::with_stream_id("memory"),
            available: AtomicBool::new(true),
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        let source = Self::new();
        source.set_available(false);
        source
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Acquire)
    }
}

impl Default for MemoryMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for MemoryMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle> {
        if !self.available.load(Ordering::Acquire) {
            return Err(Error::MediaUnavailable("capture device denied".to_owned()));
        }
        self.acquisitions.fetch_add(1, Ordering::AcqRel);
        self.tracks.build(constraints)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Registered(PeerId, String),
    Unregistered(PeerId),
    Track(PeerId, MediaKind),
}

/// Video sink that records calls instead of rendering.
#[derive(Default)]
pub struct RecordingSink {
    next: AtomicU64,
    slots: Mutex<Vec<(PeerId, SinkHandle)>>,
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn registered(&self) -> Vec<PeerId> {
        self.slots.lock().iter().map(|(peer, _)| peer.clone()).collect()
    }

    pub fn tracks_for(&self, peer: &PeerId) -> Vec<MediaKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Track(p, kind) if p == peer => Some(*kind),
                _ => None,
            })
            .collect()
    }
}

impl VideoSink for RecordingSink {
    fn register(&self, peer: &PeerId, display_name: &str) -> SinkHandle {
        let mut slots = self.slots.lock();
        if let Some((_, handle)) = slots.iter().find(|(p, _)| p == peer) {
            return *handle;
        }
        let handle = SinkHandle::new(self.next.fetch_add(1, Ordering::Relaxed));
        slots.push((peer.clone(), handle));
        self.events
            .lock()
            .push(SinkEvent::Registered(peer.clone(), display_name.to_owned()));
        handle
    }

    fn unregister(&self, peer: &PeerId) {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|(p, _)| p != peer);
        if slots.len() != before {
            self.events.lock().push(SinkEvent::Unregistered(peer.clone()));
        }
    }

    fn attach_track(&self, peer: &PeerId, track: RemoteTrack) {
        self.events.lock().push(SinkEvent::Track(peer.clone(), track.kind));
    }
}
