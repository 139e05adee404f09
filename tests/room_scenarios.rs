use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use room_rtc::config::SessionConfig;
use room_rtc::connection::ConnectionState;
use room_rtc::memory::{MemoryConnector, MemoryMediaSource, RecordingSink};
use room_rtc::registry::PeerRegistry;
use room_rtc::session::{Collaborators, RoomSession, SessionCommand};
use room_rtc::signaling::{PeerId, RelaySender, SignalingMessage};
use room_rtc::{Error, MediaKind};

/// Minimal relay: acks joins, announces members and forwards negotiation
/// messages by target id.
#[derive(Default)]
struct Hub {
    members: BTreeMap<PeerId, Member>,
}

struct Member {
    inbound: mpsc::Sender<SignalingMessage>,
    name: Option<String>,
    room: Option<String>,
}

impl Hub {
    async fn deliver(&self, to: &PeerId, msg: SignalingMessage) {
        if let Some(member) = self.members.get(to) {
            let _ = member.inbound.send(msg).await;
        }
    }

    async fn handle(&mut self, from: PeerId, msg: SignalingMessage) {
        match msg {
            SignalingMessage::ReadyForStream(room, name) => {
                if let Some(member) = self.members.get_mut(&from) {
                    member.name = Some(name);
                }
                self.deliver(&from, SignalingMessage::ReadyForStreamSuccess { room_name: room })
                    .await;
            }
            SignalingMessage::JoinRoom(room) => {
                let name = match self.members.get_mut(&from) {
                    Some(member) => {
                        member.room = Some(room.clone());
                        member.name.clone().unwrap_or_default()
                    }
                    None => return,
                };
                let others: BTreeMap<PeerId, String> = self
                    .members
                    .iter()
                    .filter(|(id, m)| **id != from && m.room.as_deref() == Some(room.as_str()))
                    .map(|(id, m)| (id.clone(), m.name.clone().unwrap_or_default()))
                    .collect();
                for id in others.keys() {
                    self.deliver(
                        id,
                        SignalingMessage::UserJoin {
                            sid: Some(from.clone()),
                            user_name: name.clone(),
                        },
                    )
                    .await;
                }
                self.deliver(
                    &from,
                    SignalingMessage::UserList {
                        my_id: from.clone(),
                        list: Some(others),
                    },
                )
                .await;
            }
            SignalingMessage::LeaveRoom(room) => {
                if let Some(member) = self.members.get_mut(&from) {
                    member.room = None;
                }
                let others: Vec<PeerId> = self
                    .members
                    .iter()
                    .filter(|(_, m)| m.room.as_deref() == Some(room.as_str()))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in others {
                    self.deliver(&id, SignalingMessage::UserLeave { sid: from.clone() })
                        .await;
                }
            }
            SignalingMessage::Message(msg) => {
                let target = msg.target_id.clone();
                self.deliver(&target, SignalingMessage::Message(msg)).await;
            }
            _ => {}
        }
    }
}

struct Participant {
    id: PeerId,
    registry: PeerRegistry,
    connector: Arc<MemoryConnector>,
    sink: Arc<RecordingSink>,
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<Result<(), Error>>,
}

impl Participant {
    async fn join(&self, room: &str, name: &str) {
        self.commands
            .send(SessionCommand::Join {
                room_name: room.into(),
                display_name: name.into(),
            })
            .await
            .unwrap();
    }
}

enum Control {
    Connect(PeerId, mpsc::Sender<SignalingMessage>),
    Disconnect(PeerId),
}

struct Room {
    frames: mpsc::UnboundedSender<(PeerId, SignalingMessage)>,
    control: mpsc::UnboundedSender<Control>,
}

impl Room {
    fn start() -> Self {
        let (frames, mut frame_rx) = mpsc::unbounded_channel::<(PeerId, SignalingMessage)>();
        let (control, mut control_rx) = mpsc::unbounded_channel::<Control>();
        tokio::spawn(async move {
            let mut hub = Hub::default();
            loop {
                tokio::select! {
                    Some(control) = control_rx.recv() => match control {
                        Control::Connect(id, inbound) => {
                            hub.members.insert(id, Member { inbound, name: None, room: None });
                        }
                        Control::Disconnect(id) => {
                            hub.members.remove(&id);
                        }
                    },
                    Some((from, msg)) = frame_rx.recv() => hub.handle(from, msg).await,
                    else => break,
                }
            }
        });
        Self { frames, control }
    }

    fn connect(&self, id: &str, config: SessionConfig) -> Participant {
        let id = PeerId::from(id);
        let (relay, mut outbound) = RelaySender::channel();
        let (inbound_tx, inbound) = mpsc::channel(64);
        self.control
            .send(Control::Connect(id.clone(), inbound_tx))
            .unwrap();

        let frames = self.frames.clone();
        let from = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                if frames.send((from.clone(), msg)).is_err() {
                    break;
                }
            }
        });

        let connector = Arc::new(MemoryConnector::new());
        let sink = Arc::new(RecordingSink::new());
        let session = RoomSession::new(
            config,
            relay,
            Collaborators {
                connector: connector.clone(),
                media: Arc::new(MemoryMediaSource::new()),
                sink: sink.clone(),
            },
        );
        let registry = session.registry().clone();
        let (commands, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(session.run(inbound, command_rx));
        Participant {
            id,
            registry,
            connector,
            sink,
            commands,
            task,
        }
    }

    /// Drops the relay's side of the participant's socket.
    fn disconnect(&self, participant: &Participant) {
        self.control
            .send(Control::Disconnect(participant.id.clone()))
            .unwrap();
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn connection_state(registry: &PeerRegistry, peer: &str) -> Option<ConnectionState> {
    registry
        .lookup(&PeerId::from(peer))
        .await
        .ok()
        .and_then(|entry| entry.connection)
}

async fn wait_joined(registry: &PeerRegistry) {
    eventually("join", || async move { registry.self_id().await.is_some() }).await;
}

async fn wait_connected(registry: &PeerRegistry, peer: &str) {
    eventually(peer, || async move {
        connection_state(registry, peer).await == Some(ConnectionState::Connected)
    })
    .await;
}

#[tokio::test]
async fn newcomer_invites_and_both_sides_connect() {
    let room = Room::start();
    let x = room.connect("x", SessionConfig::default());
    x.join("R1", "X").await;
    wait_joined(&x.registry).await;
    assert!(x.registry.is_empty().await);

    let y = room.connect("y", SessionConfig::default());
    y.join("R1", "Y").await;

    wait_connected(&x.registry, "y").await;
    wait_connected(&y.registry, "x").await;

    // One connection each, offered by the newcomer.
    assert_eq!(y.connector.connections().len(), 1);
    assert_eq!(x.connector.connections().len(), 1);
    assert_eq!(
        x.registry.lookup(&"y".into()).await.unwrap().display_name,
        "Y"
    );
    assert_eq!(
        x.sink.tracks_for(&"y".into()),
        vec![MediaKind::Audio, MediaKind::Video]
    );
    assert_eq!(
        y.sink.tracks_for(&"x".into()),
        vec![MediaKind::Audio, MediaKind::Video]
    );
}

#[tokio::test]
async fn leaving_peer_is_removed_from_the_other_side() {
    let room = Room::start();
    let x = room.connect("x", SessionConfig::default());
    x.join("R1", "X").await;
    wait_joined(&x.registry).await;
    let y = room.connect("y", SessionConfig::default());
    y.join("R1", "Y").await;
    wait_connected(&x.registry, "y").await;

    y.commands.send(SessionCommand::Leave).await.unwrap();
    let x_registry = &x.registry;
    eventually("x to drop y", || async move { x_registry.is_empty().await }).await;
    assert!(x.connector.connections()[0].is_closed());

    let y_registry = &y.registry;
    eventually("y to tear down", || async move {
        y_registry.self_id().await.is_none()
    })
    .await;
    assert!(y.connector.connections()[0].is_closed());
}

#[tokio::test]
async fn rapid_second_join_wins() {
    let room = Room::start();
    let x = room.connect("x", SessionConfig::default());
    x.join("R1", "X").await;
    x.join("R2", "X").await;
    wait_joined(&x.registry).await;

    // Only the R2 join completed, so a later member of R1 sees an empty room.
    let y = room.connect("y", SessionConfig::default());
    y.join("R1", "Y").await;
    wait_joined(&y.registry).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(y.registry.is_empty().await);
    assert!(y.connector.connections().is_empty());
    assert!(x.registry.is_empty().await);
}

#[tokio::test]
async fn same_room_resubmission_joins_once() {
    let room = Room::start();
    let x = room.connect("x", SessionConfig::default());
    x.join("R1", "X").await;
    x.join("R1", "X").await;
    wait_joined(&x.registry).await;

    let y = room.connect("y", SessionConfig::default());
    y.join("R1", "Y").await;
    wait_connected(&x.registry, "y").await;
    wait_connected(&y.registry, "x").await;

    // Give any duplicate ack or peer list time to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(x.registry.self_id().await, Some(PeerId::from("x")));
    assert_eq!(x.registry.len().await, 1);
    assert_eq!(y.registry.len().await, 1);
    assert_eq!(x.connector.connections().len(), 1);
    assert_eq!(y.connector.connections().len(), 1);
    assert_eq!(connection_state(&x.registry, "y").await, Some(ConnectionState::Connected));
}

#[tokio::test]
async fn relay_loss_tears_the_session_down() {
    let room = Room::start();
    let x = room.connect("x", SessionConfig::default());
    x.join("R1", "X").await;
    wait_joined(&x.registry).await;
    let y = room.connect("y", SessionConfig::default());
    y.join("R1", "Y").await;
    wait_connected(&y.registry, "x").await;

    room.disconnect(&y);
    let Participant {
        registry,
        connector,
        task,
        ..
    } = y;
    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::RelayDisconnected)));
    assert!(registry.is_empty().await);
    assert!(registry.self_id().await.is_none());
    assert!(connector.connections()[0].is_closed());
}
