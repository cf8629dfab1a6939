use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod capture;
pub mod denoiser;
pub mod peer;
pub mod recorder;
pub mod rtc;

pub use capture::{CaptureSource, LocalMedia, MediaTrack, StaticCaptureSource};
pub use peer::{IceState, LinkStats, PeerEvent, PeerFactory, PeerTransport};
pub use rtc::{RtcPeer, RtcPeerFactory};

use crate::TrackId;
use denoiser::NoiseReducer;
use recorder::{RecorderConfig, WavSink};

const DTMF_DIGITS: &str = "0123456789*#ABCD";

pub type DtmfReceiver = mpsc::UnboundedReceiver<char>;

/// Owns the local and remote media tracks of one peer connection. All side
/// effects are local (track enable flags, sender replacement); only track
/// add/remove raises a renegotiation, and that decision belongs to the
/// session owner observing the peer's events.
pub struct MediaSession {
    id: String,
    peer: Arc<dyn PeerTransport>,
    local: Mutex<LocalMedia>,
    zoom: Mutex<f32>,
    zoom_bounds: (f32, f32),
    dtmf_sender: mpsc::UnboundedSender<char>,
    dtmf_receiver: Mutex<Option<DtmfReceiver>>,
    recorder: Mutex<Option<WavSink>>,
    denoiser: NoiseReducer,
    cancel_token: CancellationToken,
}

pub struct MediaSessionBuilder {
    id: String,
    peer: Arc<dyn PeerTransport>,
    local: LocalMedia,
    zoom_bounds: (f32, f32),
    noise_suppression_level: u8,
    cancel_token: Option<CancellationToken>,
}

impl MediaSessionBuilder {
    pub fn new(id: String, peer: Arc<dyn PeerTransport>, local: LocalMedia) -> Self {
        Self {
            id,
            peer,
            local,
            zoom_bounds: (1.0, 4.0),
            noise_suppression_level: 0,
            cancel_token: None,
        }
    }

    pub fn with_zoom_bounds(mut self, min: f32, max: f32) -> Self {
        self.zoom_bounds = (min, max);
        self
    }

    pub fn with_noise_suppression(mut self, level: u8) -> Self {
        self.noise_suppression_level = level;
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> MediaSession {
        let (dtmf_sender, dtmf_receiver) = mpsc::unbounded_channel();
        MediaSession {
            id: self.id,
            peer: self.peer,
            local: Mutex::new(self.local),
            zoom: Mutex::new(1.0),
            zoom_bounds: self.zoom_bounds,
            dtmf_sender,
            dtmf_receiver: Mutex::new(Some(dtmf_receiver)),
            recorder: Mutex::new(None),
            denoiser: NoiseReducer::new(self.noise_suppression_level),
            cancel_token: self.cancel_token.unwrap_or_default(),
        }
    }
}

impl MediaSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &Arc<dyn PeerTransport> {
        &self.peer
    }

    pub fn subscribe_peer(&self) -> peer::PeerEventReceiver {
        self.peer.subscribe()
    }

    /// Attach the local tracks to the peer connection.
    pub async fn start(&self) -> Result<()> {
        let (audio, video) = {
            let local = self.local.lock().unwrap();
            (local.audio.clone(), local.video.clone())
        };
        self.peer.add_track(&audio).await?;
        if let Some(video) = video {
            self.peer.add_track(&video).await?;
        }
        info!(id = self.id, "media session started");
        Ok(())
    }

    pub fn local_track_ids(&self) -> Vec<TrackId> {
        self.local.lock().unwrap().track_ids()
    }

    pub fn has_video(&self) -> bool {
        self.local.lock().unwrap().video.is_some()
    }

    /// Flip the outbound audio enable flag. Returns the new state.
    pub fn toggle_audio(&self) -> bool {
        let local = self.local.lock().unwrap();
        let enabled = local.audio.toggle();
        debug!(id = self.id, enabled, "audio toggled");
        enabled
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.local.lock().unwrap().audio.set_enabled(enabled);
    }

    pub fn audio_enabled(&self) -> bool {
        self.local.lock().unwrap().audio.enabled()
    }

    /// Flip the outbound video enable flag; `None` when the session carries
    /// no video track.
    pub fn toggle_video(&self) -> Option<bool> {
        let local = self.local.lock().unwrap();
        local.video.as_ref().map(|v| {
            let enabled = v.toggle();
            debug!(id = self.id, enabled, "video toggled");
            enabled
        })
    }

    /// Swap the outbound camera track in place. Sender replacement only, no
    /// renegotiation.
    pub async fn switch_camera(&self, track: MediaTrack) -> Result<()> {
        self.swap_video(track).await
    }

    /// Swap the outbound video payload for a screen-share track.
    pub async fn replace_track(&self, track: MediaTrack) -> Result<()> {
        self.swap_video(track).await
    }

    async fn swap_video(&self, track: MediaTrack) -> Result<()> {
        let old_id = {
            let local = self.local.lock().unwrap();
            local
                .video
                .as_ref()
                .map(|v| v.id.clone())
                .ok_or_else(|| anyhow!("session has no video track to replace"))?
        };
        self.peer.replace_track(&old_id, &track).await?;
        self.local.lock().unwrap().video = Some(track);
        debug!(id = self.id, old_id, "video track swapped");
        Ok(())
    }

    /// Add a video track to an audio-only session. The peer raises
    /// `NegotiationNeeded`; the owner drives the renegotiation.
    pub async fn add_video(&self, track: MediaTrack) -> Result<()> {
        if self.has_video() {
            return Err(anyhow!("session already carries video"));
        }
        self.peer.add_track(&track).await?;
        self.local.lock().unwrap().video = Some(track);
        Ok(())
    }

    pub async fn remove_video(&self) -> Result<()> {
        let track = self.local.lock().unwrap().video.take();
        match track {
            Some(track) => self.peer.remove_track(&track.id).await,
            None => Ok(()),
        }
    }

    /// Clamp and store the capture zoom factor. Returns the applied value.
    pub fn apply_zoom(&self, factor: f32) -> f32 {
        let applied = factor.clamp(self.zoom_bounds.0, self.zoom_bounds.1);
        *self.zoom.lock().unwrap() = applied;
        applied
    }

    pub fn zoom(&self) -> f32 {
        *self.zoom.lock().unwrap()
    }

    /// Queue a DTMF digit for the owner to forward to the partner.
    pub fn send_dtmf(&self, digit: char) -> Result<()> {
        let digit = digit.to_ascii_uppercase();
        if !DTMF_DIGITS.contains(digit) {
            return Err(anyhow!("invalid dtmf digit: {}", digit));
        }
        self.dtmf_sender
            .send(digit)
            .map_err(|_| anyhow!("media session closed"))
    }

    /// The outbound DTMF queue. Single consumer; the orchestrator takes it.
    pub fn take_dtmf_receiver(&self) -> Option<DtmfReceiver> {
        self.dtmf_receiver.lock().unwrap().take()
    }

    pub fn attach_recorder(&self, path: &str, config: &RecorderConfig) -> Result<()> {
        let sink = WavSink::create(path, config)?;
        *self.recorder.lock().unwrap() = Some(sink);
        Ok(())
    }

    pub fn detach_recorder(&self) -> Result<()> {
        if let Some(mut sink) = self.recorder.lock().unwrap().take() {
            sink.finalize()?;
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().unwrap().is_some()
    }

    pub fn set_noise_suppression(&self, level: u8) {
        self.denoiser.set_level(level);
    }

    pub fn noise_suppression(&self) -> u8 {
        self.denoiser.level()
    }

    /// Run one captured PCM frame through the processing chain: noise
    /// suppression, then the recording sink when attached.
    pub fn process_capture_frame(&self, samples: &mut [i16]) {
        self.denoiser.process(samples);
        if let Some(sink) = self.recorder.lock().unwrap().as_mut() {
            if let Err(e) = sink.write_samples(samples) {
                warn!(id = self.id, "recorder write failed: {}", e);
            }
        }
    }

    pub async fn close(&self) {
        self.detach_recorder().ok();
        if let Err(e) = self.peer.close().await {
            warn!(id = self.id, "peer close failed: {}", e);
        }
        self.cancel_token.cancel();
        debug!(id = self.id, "media session closed");
    }
}
