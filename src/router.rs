use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::{Error, Result};
use crate::factory::ConnectionFactory;
use crate::registry::PeerRegistry;
use crate::signaling::{
    NegotiationKind, NegotiationMessage, NegotiationPayload, PeerId, RelaySender, SignalingMessage,
};
use crate::sink::VideoSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No self identity yet.
    NotJoined,
    /// Addressed to someone else.
    Misaddressed,
    FromSelf,
    /// Answer or candidate from a peer we hold no connection for.
    UnknownPeer,
    /// The connection was released while the message was in flight.
    Released,
}

/// What happened to an inbound negotiation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Applied(NegotiationKind),
    Answered,
    Dropped(DropReason),
    Failed(String),
}

pub struct SignalingRouter {
    registry: PeerRegistry,
    factory: Arc<ConnectionFactory>,
    relay: RelaySender,
    sink: Arc<dyn VideoSink>,
}

impl SignalingRouter {
    pub fn new(
        registry: PeerRegistry,
        factory: Arc<ConnectionFactory>,
        relay: RelaySender,
        sink: Arc<dyn VideoSink>,
    ) -> Self {
        Self {
            registry,
            factory,
            relay,
            sink,
        }
    }

    pub fn send_join(&self, room_name: &str, display_name: &str) -> Result<()> {
        self.relay.emit(SignalingMessage::ReadyForStream(
            room_name.to_owned(),
            display_name.to_owned(),
        ))
    }

    pub fn send_join_room(&self, room_name: &str) -> Result<()> {
        self.relay.emit(SignalingMessage::JoinRoom(room_name.to_owned()))
    }

    pub fn send_leave(&self, room_name: &str) -> Result<()> {
        self.relay.emit(SignalingMessage::LeaveRoom(room_name.to_owned()))
    }

    /// Registers a newcomer and its video slot. Connections are started by
    /// the newcomer's own invite, not here.
    pub async fn on_peer_joined(&self, id: PeerId, display_name: &str) -> bool {
        if !self.registry.upsert_peer(id.clone(), display_name).await {
            debug!(peer = %id, "join for known peer or self ignored");
            return false;
        }
        info!(peer = %id, %display_name, "peer joined");
        self.register_sink(&id, display_name).await;
        true
    }

    pub async fn on_peer_left(&self, id: &PeerId) -> bool {
        match self.registry.remove_peer(id).await {
            Some(_) => {
                self.sink.unregister(id);
                info!(peer = %id, "peer left");
                true
            }
            None => {
                debug!(peer = %id, "leave for unknown peer");
                false
            }
        }
    }

    pub async fn register_sink(&self, id: &PeerId, display_name: &str) {
        let handle = self.sink.register(id, display_name);
        self.registry.set_sink(id, handle).await;
    }

    pub async fn on_negotiation_message(&self, msg: NegotiationMessage) -> Dispatch {
        let kind = msg.kind();
        let Some(self_id) = self.registry.self_id().await else {
            return dropped(&msg, DropReason::NotJoined);
        };
        if msg.target_id != self_id {
            return dropped(&msg, DropReason::Misaddressed);
        }
        if msg.sender_id == self_id {
            return dropped(&msg, DropReason::FromSelf);
        }

        let handle = match self.registry.connection(&msg.sender_id).await {
            Some(handle) => handle,
            None if kind == NegotiationKind::Offer => match self.accept_caller(&msg.sender_id).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(peer = %msg.sender_id, error = %err, "cannot answer offer");
                    return Dispatch::Failed(err.to_string());
                }
            },
            None => return dropped(&msg, DropReason::UnknownPeer),
        };
        if handle.is_released() {
            return dropped(&msg, DropReason::Released);
        }

        let NegotiationMessage {
            sender_id, payload, ..
        } = msg;
        match payload {
            NegotiationPayload::Offer { sdp } => self.answer(&handle, self_id, sender_id, sdp).await,
            NegotiationPayload::Answer { sdp } => match handle.connection().accept_answer(sdp).await {
                Ok(()) => {
                    debug!(peer = %sender_id, "answer applied");
                    Dispatch::Applied(NegotiationKind::Answer)
                }
                Err(err) => fail(&handle, err),
            },
            NegotiationPayload::IceCandidate { candidate } => {
                match handle.connection().add_ice_candidate(candidate).await {
                    Ok(()) => Dispatch::Applied(NegotiationKind::IceCandidate),
                    Err(err) => {
                        // A bad candidate does not doom the connection.
                        warn!(peer = %sender_id, error = %err, "failed to add remote candidate");
                        Dispatch::Failed(err.to_string())
                    }
                }
            }
        }
    }

    /// Callee side: first offer from a peer we have no connection for.
    async fn accept_caller(&self, caller: &PeerId) -> Result<ConnectionHandle> {
        if self.registry.upsert_peer(caller.clone(), caller.as_str()).await {
            debug!(peer = %caller, "offer from unannounced peer");
            self.register_sink(caller, caller.as_str()).await;
        }
        self.factory.create_for_offer(caller).await
    }

    async fn answer(
        &self,
        handle: &ConnectionHandle,
        self_id: PeerId,
        caller: PeerId,
        sdp: String,
    ) -> Dispatch {
        if handle.state() != ConnectionState::Inviting {
            handle.monitor().update_state(ConnectionState::Answering);
        }
        let answer = match handle.connection().accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(err) => return fail(handle, err),
        };
        let reply = NegotiationMessage::new(
            self_id,
            caller.clone(),
            NegotiationPayload::Answer { sdp: answer },
        );
        let relay = self.relay.clone();
        match handle.send_description(move || relay.emit(SignalingMessage::Message(reply))) {
            Ok(true) => {
                info!(peer = %caller, "answer sent");
                Dispatch::Answered
            }
            Ok(false) => {
                debug!(peer = %caller, "released before answer was sent");
                Dispatch::Dropped(DropReason::Released)
            }
            Err(err) => {
                warn!(peer = %caller, error = %err, "cannot send answer");
                Dispatch::Failed(err.to_string())
            }
        }
    }
}

fn dropped(msg: &NegotiationMessage, reason: DropReason) -> Dispatch {
    debug!(
        kind = %msg.kind(),
        from = %msg.sender_id,
        to = %msg.target_id,
        ?reason,
        "dropping negotiation message"
    );
    Dispatch::Dropped(reason)
}

fn fail(handle: &ConnectionHandle, err: Error) -> Dispatch {
    warn!(peer = %handle.peer_id(), error = %err, "negotiation failed");
    handle.monitor().set_error(err.to_string());
    Dispatch::Failed(err.to_string())
}
