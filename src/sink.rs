use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::media::RemoteTrack;
use crate::signaling::PeerId;

/// Opaque reference to a rendering slot for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle(u64);

impl SinkHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Where remote video ends up. Registering twice for the same peer returns
/// the existing handle.
pub trait VideoSink: Send + Sync {
    fn register(&self, peer: &PeerId, display_name: &str) -> SinkHandle;
    fn unregister(&self, peer: &PeerId);
    fn attach_track(&self, peer: &PeerId, track: RemoteTrack);
}

/// Sink for headless runs: logs what a UI would render.
#[derive(Default)]
pub struct LogSink {
    next: AtomicU64,
    slots: Mutex<HashMap<PeerId, SinkHandle>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoSink for LogSink {
    fn register(&self, peer: &PeerId, display_name: &str) -> SinkHandle {
        *self.slots.lock().entry(peer.clone()).or_insert_with(|| {
            info!(%peer, %display_name, "video tile added");
            SinkHandle(self.next.fetch_add(1, Ordering::Relaxed))
        })
    }

    fn unregister(&self, peer: &PeerId) {
        if self.slots.lock().remove(peer).is_some() {
            info!(%peer, "video tile removed");
        }
    }

    fn attach_track(&self, peer: &PeerId, track: RemoteTrack) {
        info!(%peer, kind = %track.kind, track = %track.id, "remote track attached");
    }
}
