use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::media::Sample;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints { height: 360 }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl LocalMediaState {
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }
}

/// One captured track. Samples written while the track is disabled are
/// dropped, which mutes it on every connection it was attached to.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The local capture stream. Clones share tracks and mute state.
#[derive(Debug, Clone)]
pub struct LocalMediaHandle {
    stream_id: String,
    tracks: Arc<Vec<LocalTrack>>,
    state: Arc<RwLock<LocalMediaState>>,
}

impl LocalMediaHandle {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Arc::new(tracks),
            state: Arc::new(RwLock::new(LocalMediaState::default())),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn state(&self) -> LocalMediaState {
        *self.state.read()
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        let mut state = self.state.write();
        match kind {
            MediaKind::Audio => state.audio_enabled = enabled,
            MediaKind::Video => state.video_enabled = enabled,
        }
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.set_enabled(enabled);
        }
    }
}

/// Capture capability. Fails with `MediaUnavailable` when the device is
/// denied or missing.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle>;
}

/// Source producing sample-based `webrtc` tracks (Opus audio, VP8 video).
/// The embedding application feeds encoded frames through
/// [`LocalTrack::write_sample`].
#[derive(Debug, Clone, Default)]
pub struct TrackMediaSource {
    stream_id: Option<String>,
}

impl TrackMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_id(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
        }
    }

    pub fn build(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle> {
        let stream_id = self
            .stream_id
            .clone()
            .unwrap_or_else(|| format!("local-{}", rand::random::<u32>()));
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(
                MediaKind::Audio,
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    stream_id.clone(),
                )),
            ));
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(
                MediaKind::Video,
                Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_owned(),
                    stream_id.clone(),
                )),
            ));
        }
        if tracks.is_empty() {
            return Err(Error::MediaUnavailable("no audio or video requested".to_owned()));
        }
        Ok(LocalMediaHandle::new(stream_id, tracks))
    }
}

#[async_trait]
impl MediaSource for TrackMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle> {
        self.build(constraints)
    }
}

/// A track received from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub source: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            source: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(kind: MediaKind) -> LocalTrack {
        let mime = match kind {
            MediaKind::Audio => "audio/opus",
            MediaKind::Video => "video/VP8",
        };
        LocalTrack::new(
            kind,
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                kind.to_string(),
                "local".to_owned(),
            )),
        )
    }

    #[test]
    fn muting_one_kind_leaves_the_other_enabled() {
        let media = LocalMediaHandle::new("local", vec![track(MediaKind::Audio), track(MediaKind::Video)]);
        media.set_enabled(MediaKind::Audio, false);

        assert_eq!(
            media.state(),
            LocalMediaState {
                audio_enabled: false,
                video_enabled: true
            }
        );
        assert!(!media.track(MediaKind::Audio).unwrap().is_enabled());
        assert!(media.track(MediaKind::Video).unwrap().is_enabled());
    }

    #[test]
    fn clones_share_mute_state() {
        let media = LocalMediaHandle::new("local", vec![track(MediaKind::Video)]);
        let other = media.clone();
        other.set_enabled(MediaKind::Video, false);
        assert!(!media.state().video_enabled);
        assert!(!media.tracks()[0].is_enabled());
    }

    #[test]
    fn constraints_select_tracks() {
        let source = TrackMediaSource::with_stream_id("cam");
        let audio_only = source
            .build(&MediaConstraints {
                audio: true,
                video: None,
            })
            .unwrap();
        assert_eq!(audio_only.stream_id(), "cam");
        assert_eq!(audio_only.tracks().len(), 1);
        assert_eq!(audio_only.tracks()[0].kind(), MediaKind::Audio);

        let nothing = source.build(&MediaConstraints {
            audio: false,
            video: None,
        });
        assert!(matches!(nothing, Err(Error::MediaUnavailable(_))));
    }

    #[tokio::test]
    async fn disabled_track_swallows_samples() {
        let media = LocalMediaHandle::new("local", vec![track(MediaKind::Audio)]);
        media.set_enabled(MediaKind::Audio, false);
        let sample = Sample::default();
        media.tracks()[0].write_sample(&sample).await.unwrap();
    }
}
