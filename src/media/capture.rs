use crate::{
    config::CaptureProfile,
    error::CaptureError,
    model::CallKind,
    CallId, TrackId,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Handle to one local capture track. Enable state is local-only; flipping
/// it never touches the network.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: TrackId,
    pub video: bool,
    enabled: Arc<AtomicBool>,
    /// Backing webrtc sample track when running over the rtc peer.
    pub rtc: Option<Arc<TrackLocalStaticSample>>,
}

impl MediaTrack {
    pub fn new(id: TrackId, video: bool) -> Self {
        Self {
            id,
            video,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc: None,
        }
    }

    pub fn with_rtc(mut self, rtc: Arc<TrackLocalStaticSample>) -> Self {
        self.rtc = Some(rtc);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn toggle(&self) -> bool {
        let was = self.enabled.fetch_xor(true, Ordering::AcqRel);
        !was
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("video", &self.video)
            .field("enabled", &self.enabled())
            .finish()
    }
}

/// One local capture set, shared by reference across every media session of
/// a call (fan-out, not re-acquire).
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub audio: MediaTrack,
    pub video: Option<MediaTrack>,
}

impl LocalMedia {
    pub fn track_ids(&self) -> Vec<TrackId> {
        let mut ids = vec![self.audio.id.clone()];
        if let Some(ref video) = self.video {
            ids.push(video.id.clone());
        }
        ids
    }
}

/// Device capture boundary. Acquisition is idempotent per call: a second
/// acquire for the same call id returns the already-acquired tracks.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(
        &self,
        call_id: &CallId,
        kind: CallKind,
        profile: CaptureProfile,
    ) -> Result<LocalMedia, CaptureError>;

    /// Acquire a video track for an already-captured call (mid-call upgrade,
    /// camera switch, screen share).
    async fn acquire_video(
        &self,
        call_id: &CallId,
        profile: CaptureProfile,
        source_label: &str,
    ) -> Result<MediaTrack, CaptureError>;

    fn release(&self, call_id: &CallId);
}

/// Capture source producing webrtc static sample tracks. Device plumbing
/// (actual frames) is fed by the host application; this type owns track
/// identity and sharing semantics.
#[derive(Default)]
pub struct StaticCaptureSource {
    acquired: Mutex<HashMap<CallId, LocalMedia>>,
}

impl StaticCaptureSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn new_audio_track(call_id: &CallId) -> MediaTrack {
        let id = format!("audio:{}", call_id);
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            id.clone(),
            call_id.clone(),
        ));
        MediaTrack::new(id, false).with_rtc(rtc)
    }

    fn new_video_track(call_id: &CallId, label: &str) -> MediaTrack {
        let id = format!("video:{}:{}", label, call_id);
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.clone(),
            call_id.clone(),
        ));
        MediaTrack::new(id, true).with_rtc(rtc)
    }
}

#[async_trait]
impl CaptureSource for StaticCaptureSource {
    async fn acquire(
        &self,
        call_id: &CallId,
        kind: CallKind,
        _profile: CaptureProfile,
    ) -> Result<LocalMedia, CaptureError> {
        let mut acquired = self.acquired.lock().unwrap();
        if let Some(existing) = acquired.get(call_id) {
            debug!(call_id, "returning shared capture");
            return Ok(existing.clone());
        }
        let media = LocalMedia {
            audio: Self::new_audio_track(call_id),
            video: match kind {
                CallKind::Video => Some(Self::new_video_track(call_id, "camera")),
                CallKind::Voice => None,
            },
        };
        acquired.insert(call_id.clone(), media.clone());
        Ok(media)
    }

    async fn acquire_video(
        &self,
        call_id: &CallId,
        _profile: CaptureProfile,
        source_label: &str,
    ) -> Result<MediaTrack, CaptureError> {
        let track = Self::new_video_track(call_id, source_label);
        let mut acquired = self.acquired.lock().unwrap();
        if let Some(media) = acquired.get_mut(call_id) {
            media.video = Some(track.clone());
        }
        Ok(track)
    }

    fn release(&self, call_id: &CallId) {
        if self.acquired.lock().unwrap().remove(call_id).is_some() {
            debug!(call_id, "released capture");
        }
    }
}
