use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::{Error, Result};
use crate::signaling::PeerId;
use crate::sink::SinkHandle;

#[derive(Debug)]
pub struct PeerEntry {
    pub id: PeerId,
    pub display_name: String,
    connection: Option<ConnectionHandle>,
    sink: Option<SinkHandle>,
}

impl PeerEntry {
    fn new(id: PeerId, display_name: String) -> Self {
        Self {
            id,
            display_name,
            connection: None,
            sink: None,
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            connection: self.connection.as_ref().map(ConnectionHandle::state),
            sink: self.sink,
        }
    }
}

/// Copy of an entry taken under the registry lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub display_name: String,
    /// `None` until negotiation with this peer starts.
    pub connection: Option<ConnectionState>,
    pub sink: Option<SinkHandle>,
}

#[derive(Default)]
pub(crate) struct Inner {
    self_id: Option<PeerId>,
    peers: HashMap<PeerId, PeerEntry>,
}

/// Every known remote participant and its connection, if any. All access is
/// serialized by one lock that is never held across backend calls.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the local id. An entry that already uses it is evicted.
    pub async fn bind_self(&self, id: PeerId) {
        let evicted = {
            let mut inner = self.inner.lock().await;
            let evicted = inner.peers.remove(&id);
            inner.self_id = Some(id);
            evicted
        };
        if let Some(entry) = evicted {
            debug!(peer = %entry.id, "evicting entry that shadows own id");
            if let Some(handle) = entry.connection {
                handle.release().await;
            }
        }
    }

    pub async fn clear_self(&self) {
        self.inner.lock().await.self_id = None;
    }

    pub async fn self_id(&self) -> Option<PeerId> {
        self.inner.lock().await.self_id.clone()
    }

    /// Returns true when a new entry was created.
    pub async fn upsert_peer(&self, id: PeerId, display_name: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.self_id.as_ref() == Some(&id) || inner.peers.contains_key(&id) {
            return false;
        }
        debug!(peer = %id, "peer registered");
        inner
            .peers
            .insert(id.clone(), PeerEntry::new(id, display_name.into()));
        true
    }

    /// Removes the entry and releases its connection.
    pub async fn remove_peer(&self, id: &PeerId) -> Option<PeerSnapshot> {
        let entry = self.inner.lock().await.peers.remove(id)?;
        debug!(peer = %id, "peer removed");
        let snapshot = entry.snapshot();
        if let Some(handle) = entry.connection {
            handle.release().await;
        }
        Some(snapshot)
    }

    pub async fn attach_connection(&self, id: &PeerId, handle: ConnectionHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .peers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))?;
        if entry.connection.is_some() {
            return Err(Error::AlreadyConnected(id.to_string()));
        }
        entry.connection = Some(handle);
        Ok(())
    }

    /// Unbinds `handle` if it is still the connection bound to `id`.
    pub async fn detach_connection(&self, id: &PeerId, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.peers.get_mut(id) {
            Some(entry) if entry.connection.as_ref().is_some_and(|h| h.same_as(handle)) => {
                entry.connection = None;
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, id: &PeerId) -> Result<PeerSnapshot> {
        self.inner
            .lock()
            .await
            .peers
            .get(id)
            .map(PeerEntry::snapshot)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub async fn connection(&self, id: &PeerId) -> Option<ConnectionHandle> {
        self.inner
            .lock()
            .await
            .peers
            .get(id)
            .and_then(|entry| entry.connection.clone())
    }

    pub async fn set_sink(&self, id: &PeerId, sink: SinkHandle) -> bool {
        match self.inner.lock().await.peers.get_mut(id) {
            Some(entry) => {
                entry.sink = Some(sink);
                true
            }
            None => false,
        }
    }

    /// Ids at the time of the call; later inserts and removals are not seen.
    pub async fn all_peer_ids(&self) -> impl Iterator<Item = PeerId> {
        let ids: Vec<PeerId> = self.inner.lock().await.peers.keys().cloned().collect();
        ids.into_iter()
    }

    pub async fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .inner
            .lock()
            .await
            .peers
            .values()
            .map(PeerEntry::snapshot)
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes every entry and releases every connection.
    pub async fn drain(&self) -> Vec<PeerSnapshot> {
        let entries: Vec<PeerEntry> = {
            let mut inner = self.inner.lock().await;
            inner.peers.drain().map(|(_, entry)| entry).collect()
        };
        let mut removed = Vec::with_capacity(entries.len());
        for entry in entries {
            removed.push(entry.snapshot());
            if let Some(handle) = entry.connection {
                handle.release().await;
            }
        }
        removed
    }

    /// Holds the registry lock so tests can park a caller on it.
    #[cfg(test)]
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Inner> {
        self.inner.lock().await
    }
}
