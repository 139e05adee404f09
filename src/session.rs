use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::connection::{ConnectionHandle, ConnectionState, Connector};
use crate::error::{Error, Result};
use crate::factory::ConnectionFactory;
use crate::media::{LocalMediaHandle, MediaKind, MediaSource};
use crate::registry::{PeerRegistry, PeerSnapshot};
use crate::router::{Dispatch, SignalingRouter};
use crate::signaling::{PeerId, RelaySender, SignalingMessage};
use crate::sink::VideoSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    /// `readyForStream` sent, waiting for `readyForStreamSuccess`.
    AwaitingAck,
    /// `join_room` sent, waiting for `user-list`.
    AwaitingPeerList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining {
        room_name: String,
        display_name: String,
        phase: JoinPhase,
    },
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    pub id: PeerId,
    pub room_name: String,
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    Join {
        room_name: String,
        display_name: String,
    },
    Leave,
    SetTrackEnabled {
        kind: MediaKind,
        enabled: bool,
    },
}

/// External capabilities the session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub media: Arc<dyn MediaSource>,
    pub sink: Arc<dyn VideoSink>,
}

/// One participant's membership in a room.
pub struct RoomSession {
    config: SessionConfig,
    state: SessionState,
    identity: Option<SelfIdentity>,
    registry: PeerRegistry,
    factory: Arc<ConnectionFactory>,
    router: SignalingRouter,
    media_source: Arc<dyn MediaSource>,
    sink: Arc<dyn VideoSink>,
    invites: JoinSet<()>,
    /// `user_join`s that raced ahead of our own `user-list`.
    early_joins: Vec<(PeerId, String)>,
}

impl RoomSession {
    pub fn new(config: SessionConfig, relay: RelaySender, collaborators: Collaborators) -> Self {
        let registry = PeerRegistry::new();
        let factory = Arc::new(ConnectionFactory::new(
            registry.clone(),
            relay.clone(),
            collaborators.connector,
            collaborators.sink.clone(),
            config.ice_servers.clone(),
        ));
        let router = SignalingRouter::new(
            registry.clone(),
            factory.clone(),
            relay,
            collaborators.sink.clone(),
        );
        Self {
            config,
            state: SessionState::Idle,
            identity: None,
            registry,
            factory,
            router,
            media_source: collaborators.media,
            sink: collaborators.sink,
            invites: JoinSet::new(),
            early_joins: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&SelfIdentity> {
        self.identity.as_ref()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn local_media(&self) -> Option<LocalMediaHandle> {
        self.factory.media()
    }

    pub async fn peer_states(&self) -> Vec<PeerSnapshot> {
        self.registry.snapshot().await
    }

    /// Starts (or restarts) the join handshake. Blank input is ignored.
    pub async fn submit_join(&mut self, room_name: &str, display_name: &str) -> Result<()> {
        let room_name = room_name.trim();
        let display_name = display_name.trim();
        if room_name.is_empty() || display_name.is_empty() {
            debug!("ignoring join with empty room or name");
            return Ok(());
        }
        if self.state == SessionState::Joined {
            warn!(room = %room_name, "already in a room; leave first");
            return Ok(());
        }

        if self.factory.media().is_none() {
            match self.media_source.acquire(&self.config.media).await {
                Ok(media) => self.factory.set_media(Some(media)),
                Err(err) => {
                    warn!(error = %err, "cannot start local media");
                    return Err(err);
                }
            }
        }

        if let SessionState::Joining { room_name: previous, .. } = &self.state {
            debug!(%previous, next = %room_name, "superseding pending join");
        }
        self.router.send_join(room_name, display_name)?;
        self.early_joins.clear();
        self.state = SessionState::Joining {
            room_name: room_name.to_owned(),
            display_name: display_name.to_owned(),
            phase: JoinPhase::AwaitingAck,
        };
        info!(room = %room_name, name = %display_name, "joining room");
        Ok(())
    }

    pub async fn handle_relay(&mut self, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::ReadyForStreamSuccess { room_name } => {
                self.on_join_acknowledged(&room_name)
            }
            SignalingMessage::UserList { my_id, list } => {
                self.on_peer_list(my_id, list.unwrap_or_default()).await;
                Ok(())
            }
            SignalingMessage::UserJoin { sid, user_name } => {
                let Some(sid) = sid else {
                    error!(%user_name, "user_join without sid");
                    return Ok(());
                };
                match &self.state {
                    SessionState::Joined => {
                        self.router.on_peer_joined(sid, &user_name).await;
                    }
                    SessionState::Joining {
                        phase: JoinPhase::AwaitingPeerList,
                        ..
                    } => {
                        debug!(peer = %sid, "user_join ahead of peer list held");
                        self.early_joins.push((sid, user_name));
                    }
                    _ => debug!(peer = %sid, "user_join outside a joined room"),
                }
                Ok(())
            }
            SignalingMessage::UserLeave { sid } => {
                self.router.on_peer_left(&sid).await;
                Ok(())
            }
            SignalingMessage::Message(msg) => {
                let kind = msg.kind();
                let from = msg.sender_id.clone();
                // The router logs drops and failures where it decides them.
                if let Dispatch::Applied(_) | Dispatch::Answered =
                    self.router.on_negotiation_message(msg).await
                {
                    trace!(%kind, peer = %from, "negotiation message handled");
                }
                Ok(())
            }
            other => {
                debug!(event = other.event_name(), "ignoring outbound-only event");
                Ok(())
            }
        }
    }

    fn on_join_acknowledged(&mut self, acked_room: &str) -> Result<()> {
        let pending = matches!(
            &self.state,
            SessionState::Joining { room_name, phase: JoinPhase::AwaitingAck, .. }
                if room_name == acked_room
        );
        if !pending {
            debug!(room = %acked_room, "stale join acknowledgment ignored");
            return Ok(());
        }
        self.router.send_join_room(acked_room)?;
        if let SessionState::Joining { phase, .. } = &mut self.state {
            *phase = JoinPhase::AwaitingPeerList;
        }
        debug!(room = %acked_room, "join acknowledged");
        Ok(())
    }

    async fn on_peer_list(&mut self, my_id: PeerId, list: BTreeMap<PeerId, String>) {
        let room_name = match &self.state {
            SessionState::Joining {
                room_name,
                phase: JoinPhase::AwaitingPeerList,
                ..
            } => room_name.clone(),
            _ => {
                debug!(id = %my_id, "peer list outside join handshake ignored");
                return;
            }
        };

        self.registry.bind_self(my_id.clone()).await;
        self.identity = Some(SelfIdentity {
            id: my_id.clone(),
            room_name: room_name.clone(),
        });
        self.state = SessionState::Joined;

        for (id, display_name) in list {
            if self.registry.upsert_peer(id.clone(), display_name.as_str()).await {
                self.router.register_sink(&id, &display_name).await;
            }
        }
        let peers: Vec<PeerId> = self.registry.all_peer_ids().await.collect();
        // Newcomers announced before the list invite us, so they only get registered.
        for (id, display_name) in std::mem::take(&mut self.early_joins) {
            self.router.on_peer_joined(id, &display_name).await;
        }
        info!(room = %room_name, id = %my_id, peers = peers.len(), "joined room");
        for peer in peers {
            self.spawn_invite(peer);
        }
    }

    fn spawn_invite(&mut self, peer: PeerId) {
        let factory = self.factory.clone();
        let timeout = self.config.invite_timeout;
        self.invites.spawn(async move {
            match factory.create_and_invite(&peer).await {
                Ok(handle) => {
                    if let Some(timeout) = timeout {
                        tokio::spawn(watch_invite(handle, timeout));
                    }
                }
                Err(err) if err.is_benign() => debug!(%peer, error = %err, "invite skipped"),
                Err(err) => warn!(%peer, error = %err, "invite failed"),
            }
        });
    }

    /// Waits for every in-flight invite to finish.
    pub async fn settle(&mut self) {
        while let Some(result) = self.invites.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!(error = %err, "invite task panicked");
                }
            }
        }
    }

    pub fn set_track_enabled(&self, kind: MediaKind, enabled: bool) {
        match self.factory.media() {
            Some(media) => {
                media.set_enabled(kind, enabled);
                info!(%kind, enabled, "local track toggled");
            }
            None => debug!(%kind, "no local media to toggle"),
        }
    }

    pub async fn leave(&mut self) {
        // The relay has us in the room once `join_room` went out.
        let announced = match &self.state {
            SessionState::Idle | SessionState::Left => return,
            SessionState::Joined => self.identity.as_ref().map(|i| i.room_name.clone()),
            SessionState::Joining {
                room_name,
                phase: JoinPhase::AwaitingPeerList,
                ..
            } => Some(room_name.clone()),
            SessionState::Joining { .. } => None,
        };
        if let Some(room_name) = announced {
            if let Err(err) = self.router.send_leave(&room_name) {
                debug!(error = %err, "could not announce leave");
            }
        }
        self.teardown().await;
        self.state = SessionState::Left;
        info!("left room");
    }

    pub async fn on_relay_disconnected(&mut self) {
        warn!("relay disconnected");
        self.teardown().await;
        self.state = SessionState::Idle;
    }

    async fn teardown(&mut self) {
        self.invites.abort_all();
        self.settle().await;
        for peer in self.registry.drain().await {
            self.sink.unregister(&peer.id);
        }
        self.registry.clear_self().await;
        self.identity = None;
        self.early_joins.clear();
    }

    pub async fn handle_command(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Join {
                room_name,
                display_name,
            } => self.submit_join(&room_name, &display_name).await,
            SessionCommand::Leave => {
                self.leave().await;
                Ok(())
            }
            SessionCommand::SetTrackEnabled { kind, enabled } => {
                self.set_track_enabled(kind, enabled);
                Ok(())
            }
        }
    }

    /// Drives the session until the relay goes away or the command channel
    /// closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<SignalingMessage>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(err) = self.handle_relay(msg).await {
                            if matches!(err, Error::RelayDisconnected) {
                                self.on_relay_disconnected().await;
                                return Err(err);
                            }
                            warn!(error = %err, "relay event failed");
                        }
                    }
                    None => {
                        self.on_relay_disconnected().await;
                        return Err(Error::RelayDisconnected);
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(err) = self.handle_command(command).await {
                            if matches!(err, Error::RelayDisconnected) {
                                self.on_relay_disconnected().await;
                                return Err(err);
                            }
                            warn!(error = %err, "command failed");
                        }
                    }
                    None => {
                        self.leave().await;
                        return Ok(());
                    }
                },
                Some(result) = self.invites.join_next(), if !self.invites.is_empty() => {
                    if let Err(err) = result {
                        if err.is_panic() {
                            error!(error = %err, "invite task panicked");
                        }
                    }
                }
            }
        }
    }
}

async fn watch_invite(handle: ConnectionHandle, timeout: Duration) {
    let mut status = handle.monitor().subscribe();
    let settled = tokio::time::timeout(
        timeout,
        status.wait_for(|s| s.state != ConnectionState::Inviting),
    )
    .await
    .is_ok();
    if !settled && handle.monitor().expire_invite() {
        warn!(peer = %handle.peer_id(), "invite timed out");
    }
}
