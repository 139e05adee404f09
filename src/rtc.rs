use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::connection::{
    CandidateHook, Connector, PeerConnection, StateHook, TrackHook, TransportState,
};
use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::IceCandidate;

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                TransportState::New
            }
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        }
    }
}

/// Builds `webrtc` peer connections with the default codecs and
/// interceptors registered.
pub struct RtcConnector {
    api: API,
}

impl RtcConnector {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>> {
        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);
        debug!(servers = ice_servers.len(), "peer connection created");
        Ok(Arc::new(RtcPeerConnection { peer_connection }) as Arc<dyn PeerConnection>)
    }
}

pub struct RtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeerConnection {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn on_local_candidate(&self, hook: CandidateHook) {
        let hook: Arc<dyn Fn(IceCandidate) + Send + Sync> = Arc::from(hook);
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let hook = hook.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => hook(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(err) => warn!(error = %err, "cannot serialize local candidate"),
                }
            })
        }));
    }

    fn on_remote_track(&self, hook: TrackHook) {
        let hook: Arc<dyn Fn(RemoteTrack) + Send + Sync> = Arc::from(hook);
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let hook = hook.clone();
                Box::pin(async move {
                    let mut remote =
                        RemoteTrack::new(track.id(), track.stream_id(), track.kind().into());
                    remote.source = Some(track);
                    hook(remote);
                })
            }));
    }

    fn on_state_change(&self, hook: StateHook) {
        let hook: Arc<dyn Fn(TransportState) + Send + Sync> = Arc::from(hook);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                trace!(%state, "peer connection state changed");
                hook(state.into());
                Box::pin(async {})
            }));
    }

    async fn add_track(&self, track: &LocalTrack, enabled: bool) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        debug!(kind = %track.kind(), id = track.id(), enabled, "local track added");

        // RTCP has to be drained for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.peer_connection.set_remote_description(offer).await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
