use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionState, Connector, PeerConnection};
use crate::error::{Error, Result};
use crate::media::LocalMediaHandle;
use crate::registry::PeerRegistry;
use crate::signaling::{NegotiationMessage, NegotiationPayload, PeerId, RelaySender, SignalingMessage};
use crate::sink::VideoSink;

/// Creates one connection per remote peer and wires it into the session.
pub struct ConnectionFactory {
    registry: PeerRegistry,
    relay: RelaySender,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn VideoSink>,
    ice_servers: Vec<String>,
    media: RwLock<Option<LocalMediaHandle>>,
}

impl ConnectionFactory {
    pub fn new(
        registry: PeerRegistry,
        relay: RelaySender,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn VideoSink>,
        ice_servers: Vec<String>,
    ) -> Self {
        Self {
            registry,
            relay,
            connector,
            sink,
            ice_servers,
            media: RwLock::new(None),
        }
    }

    pub fn set_media(&self, media: Option<LocalMediaHandle>) {
        *self.media.write() = media;
    }

    pub fn media(&self) -> Option<LocalMediaHandle> {
        self.media.read().clone()
    }

    /// Connects to `peer_id` and sends it an offer.
    pub async fn create_and_invite(&self, peer_id: &PeerId) -> Result<ConnectionHandle> {
        let (handle, self_id) = self.establish(peer_id, ConnectionState::Inviting).await?;

        let sdp = match handle.connection().create_offer().await {
            Ok(sdp) => sdp,
            Err(_) if handle.is_released() => {
                return Err(Error::InviteCancelled(peer_id.to_string()));
            }
            Err(err) => {
                warn!(peer = %peer_id, error = %err, "failed to create offer");
                handle.monitor().set_error(err.to_string());
                return Err(err);
            }
        };

        let offer = NegotiationMessage::new(
            self_id,
            peer_id.clone(),
            NegotiationPayload::Offer { sdp },
        );
        let relay = self.relay.clone();
        if !handle.send_description(move || relay.emit(SignalingMessage::Message(offer)))? {
            info!(peer = %peer_id, "peer released before offer was sent");
            return Err(Error::InviteCancelled(peer_id.to_string()));
        }
        info!(peer = %peer_id, "offer sent");
        Ok(handle)
    }

    /// Connection for the answering side. The caller applies the offer.
    pub async fn create_for_offer(&self, peer_id: &PeerId) -> Result<ConnectionHandle> {
        let (handle, _) = self.establish(peer_id, ConnectionState::Answering).await?;
        Ok(handle)
    }

    async fn establish(
        &self,
        peer_id: &PeerId,
        initial: ConnectionState,
    ) -> Result<(ConnectionHandle, PeerId)> {
        let self_id = self.registry.self_id().await.ok_or(Error::NotJoined)?;
        if *peer_id == self_id {
            return Err(Error::SelfConnectionAttempt);
        }
        if self.registry.connection(peer_id).await.is_some() {
            debug!(peer = %peer_id, "connection already exists");
            return Err(Error::DuplicateConnection);
        }
        let media = self
            .media()
            .ok_or_else(|| Error::MediaUnavailable("local media not acquired".to_owned()))?;

        let connection = self.connector.connect(&self.ice_servers).await?;
        // Closed on drop until the registry owns it, so a cancelled caller
        // cannot strand it.
        let mut unbound = Unbound::new(connection.clone());

        let relay = self.relay.clone();
        let (from, to) = (self_id.clone(), peer_id.clone());
        let handle = ConnectionHandle::new(peer_id.clone(), connection.clone(), move |candidate| {
            let msg = NegotiationMessage::new(
                from.clone(),
                to.clone(),
                NegotiationPayload::IceCandidate { candidate },
            );
            if let Err(err) = relay.emit(SignalingMessage::Message(msg)) {
                debug!(peer = %to, error = %err, "dropping local candidate");
            }
        });

        // Hooks go in before any track so no negotiation event is missed.
        connection.on_local_candidate(Box::new(handle.candidate_sink()));
        let sink = self.sink.clone();
        let track_peer = peer_id.clone();
        connection.on_remote_track(Box::new(move |track| {
            debug!(peer = %track_peer, kind = %track.kind, "remote track received");
            sink.attach_track(&track_peer, track);
        }));
        let monitor = handle.monitor().clone();
        connection.on_state_change(Box::new(move |state| monitor.update_transport_state(state)));
        handle.monitor().update_state(initial);

        let attached = self.registry.attach_connection(peer_id, handle.clone()).await;
        unbound.disarm();
        match attached {
            Ok(()) => {}
            Err(Error::AlreadyConnected(_)) => {
                debug!(peer = %peer_id, "lost connection race");
                handle.release().await;
                return Err(Error::DuplicateConnection);
            }
            Err(err) => {
                handle.release().await;
                return Err(err);
            }
        }

        let state = media.state();
        for track in media.tracks() {
            let enabled = state.is_enabled(track.kind());
            if let Err(err) = connection.add_track(track, enabled).await {
                warn!(peer = %peer_id, kind = %track.kind(), error = %err, "failed to attach track");
                self.rollback(peer_id, &handle).await;
                return Err(err);
            }
        }
        debug!(peer = %peer_id, tracks = media.tracks().len(), "local tracks attached");

        Ok((handle, self_id))
    }

    async fn rollback(&self, peer_id: &PeerId, handle: &ConnectionHandle) {
        self.registry.detach_connection(peer_id, handle).await;
        handle.release().await;
    }
}

/// A connection that no registry entry owns yet.
struct Unbound {
    connection: Option<Arc<dyn PeerConnection>>,
}

impl Unbound {
    fn new(connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    fn disarm(&mut self) {
        self.connection = None;
    }
}

impl Drop for Unbound {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = connection.close().await {
                        debug!(error = %err, "failed to close abandoned connection");
                    }
                });
            }
            Err(_) => warn!("no runtime to close abandoned connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaKind, MediaSource};
    use crate::memory::{BackendEvent, MemoryConnector, MemoryMediaSource, RecordingSink};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::Notify;

    struct Fixture {
        factory: Arc<ConnectionFactory>,
        registry: PeerRegistry,
        connector: Arc<MemoryConnector>,
        outbound: UnboundedReceiver<SignalingMessage>,
    }

    async fn fixture() -> Fixture {
        let registry = PeerRegistry::new();
        registry.bind_self("me".into()).await;
        registry.upsert_peer("bob".into(), "Bob").await;
        let (relay, outbound) = RelaySender::channel();
        let connector = Arc::new(MemoryConnector::new());
        let factory = Arc::new(ConnectionFactory::new(
            registry.clone(),
            relay,
            connector.clone(),
            Arc::new(RecordingSink::new()),
            vec!["stun:stun.example.org:3478".to_owned()],
        ));
        let media = MemoryMediaSource::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        factory.set_media(Some(media));
        Fixture {
            factory,
            registry,
            connector,
            outbound,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<SignalingMessage>) -> Vec<NegotiationMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let SignalingMessage::Message(neg) = msg {
                out.push(neg);
            }
        }
        out
    }

    #[tokio::test]
    async fn inviting_self_fails_without_touching_the_registry() {
        let fx = fixture().await;
        let before = fx.registry.snapshot().await;

        let result = fx.factory.create_and_invite(&"me".into()).await;
        assert!(matches!(result, Err(Error::SelfConnectionAttempt)));
        assert_eq!(fx.registry.snapshot().await, before);
        assert!(fx.connector.connections().is_empty());
    }

    #[tokio::test]
    async fn second_invite_is_a_duplicate() {
        let mut fx = fixture().await;
        let first = fx.factory.create_and_invite(&"bob".into()).await.unwrap();
        let second = fx.factory.create_and_invite(&"bob".into()).await;

        assert!(matches!(second, Err(Error::DuplicateConnection)));
        assert_eq!(fx.connector.connections().len(), 1);
        assert!(fx.registry.connection(&"bob".into()).await.unwrap().same_as(&first));
        let offers = drain(&mut fx.outbound)
            .into_iter()
            .filter(|m| matches!(m.payload, NegotiationPayload::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn hooks_are_registered_before_tracks_and_offer() {
        let fx = fixture().await;
        fx.factory.create_and_invite(&"bob".into()).await.unwrap();

        let events = fx.connector.connections()[0].events();
        let position = |pred: &dyn Fn(&BackendEvent) -> bool| events.iter().position(pred).unwrap();
        let hook = position(&|e| *e == BackendEvent::CandidateHookSet);
        let first_track = position(&|e| matches!(e, BackendEvent::TrackAttached { .. }));
        let offer = position(&|e| *e == BackendEvent::OfferCreated);
        assert!(hook < first_track);
        assert!(first_track < offer);
        assert_eq!(
            fx.connector.connections()[0].ice_servers(),
            ["stun:stun.example.org:3478".to_owned()]
        );
    }

    #[tokio::test]
    async fn candidates_follow_the_offer() {
        let mut fx = fixture().await;
        fx.factory.create_and_invite(&"bob".into()).await.unwrap();

        let sent = drain(&mut fx.outbound);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].payload, NegotiationPayload::Offer { .. }));
        assert!(matches!(sent[1].payload, NegotiationPayload::IceCandidate { .. }));
        assert_eq!(sent[1].sender_id, PeerId::from("me"));
        assert_eq!(sent[1].target_id, PeerId::from("bob"));
    }

    #[tokio::test]
    async fn missing_media_aborts_before_anything_is_registered() {
        let fx = fixture().await;
        fx.factory.set_media(None);

        let result = fx.factory.create_and_invite(&"bob".into()).await;
        assert!(matches!(result, Err(Error::MediaUnavailable(_))));
        assert!(fx.connector.connections().is_empty());
        assert_eq!(fx.registry.lookup(&"bob".into()).await.unwrap().connection, None);
    }

    #[tokio::test]
    async fn muted_kinds_attach_disabled() {
        let fx = fixture().await;
        fx.factory.media().unwrap().set_enabled(MediaKind::Video, false);
        fx.factory.create_and_invite(&"bob".into()).await.unwrap();

        let attached: Vec<BackendEvent> = fx.connector.connections()[0]
            .events()
            .into_iter()
            .filter(|e| matches!(e, BackendEvent::TrackAttached { .. }))
            .collect();
        assert_eq!(
            attached,
            vec![
                BackendEvent::TrackAttached {
                    kind: MediaKind::Audio,
                    enabled: true
                },
                BackendEvent::TrackAttached {
                    kind: MediaKind::Video,
                    enabled: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn offer_failure_marks_only_that_peer_failed() {
        let mut fx = fixture().await;
        fx.registry.upsert_peer("carol".into(), "Carol").await;
        fx.connector.fail_offers(true);
        let result = fx.factory.create_and_invite(&"bob".into()).await;
        assert!(matches!(result, Err(Error::Negotiation(_))));
        assert_eq!(
            fx.registry.lookup(&"bob".into()).await.unwrap().connection,
            Some(ConnectionState::Failed)
        );

        fx.connector.fail_offers(false);
        fx.factory.create_and_invite(&"carol".into()).await.unwrap();
        let sent = drain(&mut fx.outbound);
        assert!(sent.iter().all(|m| m.target_id == PeerId::from("carol")));
    }

    #[tokio::test]
    async fn releasing_mid_offer_cancels_the_invite() {
        let mut fx = fixture().await;
        let gate = fx.connector.hold_offers();
        let factory = fx.factory.clone();
        let invite = tokio::spawn(async move { factory.create_and_invite(&"bob".into()).await });

        loop {
            let started = fx
                .connector
                .connections()
                .first()
                .is_some_and(|c| c.events().contains(&BackendEvent::OfferCreated));
            if started {
                break;
            }
            tokio::task::yield_now().await;
        }
        fx.registry.remove_peer(&"bob".into()).await;
        gate.notify_one();

        let result = invite.await.unwrap();
        assert!(matches!(result, Err(Error::InviteCancelled(_))));
        assert!(fx.connector.connections()[0].is_closed());
        assert!(drain(&mut fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn released_handle_emits_nothing_more() {
        let mut fx = fixture().await;
        let handle = fx.factory.create_and_invite(&"bob".into()).await.unwrap();
        drain(&mut fx.outbound);

        fx.registry.remove_peer(&"bob".into()).await;
        assert!(handle.is_released());
        let connection = fx.connector.connections()[0].clone();
        assert!(connection.events().contains(&BackendEvent::Closed));

        connection.emit_candidate("candidate:late 1 udp 1 10.0.0.9 5000 typ host");
        assert!(drain(&mut fx.outbound).is_empty());
    }

    /// Parks every caller after the connection exists but before it is
    /// returned.
    struct GatedConnector {
        inner: Arc<MemoryConnector>,
        connected: Arc<Notify>,
        proceed: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>> {
            let connection = self.inner.connect(ice_servers).await?;
            self.connected.notify_one();
            self.proceed.notified().await;
            Ok(connection)
        }
    }

    #[tokio::test]
    async fn cancelled_invite_closes_its_unbound_connection() {
        let registry = PeerRegistry::new();
        registry.bind_self("me".into()).await;
        registry.upsert_peer("bob".into(), "Bob").await;
        let (relay, _outbound) = RelaySender::channel();
        let memory = Arc::new(MemoryConnector::new());
        let connected = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let factory = Arc::new(ConnectionFactory::new(
            registry.clone(),
            relay,
            Arc::new(GatedConnector {
                inner: memory.clone(),
                connected: connected.clone(),
                proceed: proceed.clone(),
            }),
            Arc::new(RecordingSink::new()),
            Vec::new(),
        ));
        let media = MemoryMediaSource::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        factory.set_media(Some(media));

        let invite = tokio::spawn({
            let factory = factory.clone();
            async move { factory.create_and_invite(&"bob".into()).await }
        });
        connected.notified().await;

        // The invite now parks on the registry lock between connect and attach.
        let guard = registry.lock().await;
        proceed.notify_one();
        let connection = memory.connections()[0].clone();
        while !connection.events().contains(&BackendEvent::StateHookSet) {
            tokio::task::yield_now().await;
        }
        invite.abort();
        assert!(invite.await.unwrap_err().is_cancelled());
        drop(guard);

        for _ in 0..10 {
            if connection.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(connection.is_closed());
        assert_eq!(registry.lookup(&"bob".into()).await.unwrap().connection, None);
    }
}
