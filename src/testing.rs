//! Shared test doubles for the media and session layers.

use crate::{
    config::CaptureProfile,
    error::CaptureError,
    media::{
        capture::{CaptureSource, LocalMedia, MediaTrack},
        peer::{IceState, LinkStats, PeerEvent, PeerEventReceiver, PeerFactory, PeerTransport},
    },
    model::CallKind,
    CallId, TrackId,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::broadcast;

/// In-memory peer double. When `auto_connect` is set (the default), a
/// completed offer/answer exchange immediately reports ICE connected and a
/// flowing remote audio track.
pub struct FakePeer {
    pub id: String,
    auto_connect: AtomicBool,
    state: Mutex<IceState>,
    stats: Mutex<LinkStats>,
    tracks: Mutex<Vec<MediaTrack>>,
    events: broadcast::Sender<PeerEvent>,
    offers: AtomicUsize,
    negotiations: AtomicUsize,
    pub closed: AtomicBool,
}

impl FakePeer {
    pub fn new(id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id: id.to_string(),
            auto_connect: AtomicBool::new(true),
            state: Mutex::new(IceState::New),
            stats: Mutex::new(LinkStats::default()),
            tracks: Mutex::new(Vec::new()),
            events,
            offers: AtomicUsize::new(0),
            negotiations: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::Release);
    }

    pub fn set_ice_state(&self, state: IceState) {
        *self.state.lock().unwrap() = state;
        self.events.send(PeerEvent::IceState(state)).ok();
    }

    pub fn set_stats(&self, stats: LinkStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn emit_remote_track(&self, track_id: &str, video: bool) {
        self.events
            .send(PeerEvent::RemoteTrack {
                track_id: track_id.to_string(),
                video,
            })
            .ok();
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.lock().unwrap().iter().map(|t| t.id.clone()).collect()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::Acquire)
    }

    pub fn negotiation_count(&self) -> usize {
        self.negotiations.load(Ordering::Acquire)
    }

    fn settle(&self) {
        if self.auto_connect.load(Ordering::Acquire) {
            self.set_ice_state(IceState::Connected);
            self.emit_remote_track(&format!("remote:{}", self.id), false);
        }
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn create_offer(&self) -> Result<String> {
        let n = self.offers.fetch_add(1, Ordering::AcqRel);
        Ok(format!("offer:{}:{}", self.id, n))
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String> {
        let answer = format!("answer:{}:{}", self.id, remote_offer);
        self.settle();
        Ok(answer)
    }

    async fn accept_answer(&self, _remote_answer: &str) -> Result<()> {
        self.settle();
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        _candidate: &str,
        _sdp_mid: Option<String>,
        _sdp_mline_index: Option<u32>,
    ) -> Result<()> {
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.tracks.lock().unwrap().push(track.clone());
        self.negotiations.fetch_add(1, Ordering::AcqRel);
        self.events.send(PeerEvent::NegotiationNeeded).ok();
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        self.tracks.lock().unwrap().retain(|t| &t.id != track_id);
        self.negotiations.fetch_add(1, Ordering::AcqRel);
        self.events.send(PeerEvent::NegotiationNeeded).ok();
        Ok(())
    }

    async fn replace_track(&self, old_id: &TrackId, track: &MediaTrack) -> Result<()> {
        let mut tracks = self.tracks.lock().unwrap();
        let slot = tracks
            .iter_mut()
            .find(|t| &t.id == old_id)
            .ok_or_else(|| anyhow!("no sender for track: {}", old_id))?;
        *slot = track.clone();
        Ok(())
    }

    async fn stats(&self) -> Result<LinkStats> {
        Ok(self.stats.lock().unwrap().clone())
    }

    fn ice_state(&self) -> IceState {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self) -> PeerEventReceiver {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        *self.state.lock().unwrap() = IceState::Closed;
        Ok(())
    }
}

/// Factory recording every peer it hands out so tests can reach them.
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<(String, Arc<FakePeer>)>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer_for(&self, id_prefix: &str) -> Option<Arc<FakePeer>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id.starts_with(id_prefix))
            .map(|(_, peer)| peer.clone())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, id: &str) -> Result<Arc<dyn PeerTransport>> {
        let peer = FakePeer::new(id);
        self.created
            .lock()
            .unwrap()
            .push((id.to_string(), peer.clone()));
        Ok(peer as Arc<dyn PeerTransport>)
    }
}

/// Capture double with scriptable failures and shared-per-call semantics.
#[derive(Default)]
pub struct FakeCaptureSource {
    fail_next: Mutex<Option<CaptureError>>,
    acquired: Mutex<HashMap<CallId, LocalMedia>>,
    acquire_calls: AtomicUsize,
    released: Mutex<Vec<CallId>>,
}

impl FakeCaptureSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next acquire fails with `error`; subsequent calls succeed again.
    pub fn fail_next(&self, error: CaptureError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::Acquire)
    }

    pub fn distinct_acquired(&self) -> usize {
        self.acquired.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<CallId> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureSource for FakeCaptureSource {
    async fn acquire(
        &self,
        call_id: &CallId,
        kind: CallKind,
        _profile: CaptureProfile,
    ) -> Result<LocalMedia, CaptureError> {
        self.acquire_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(error);
        }
        let mut acquired = self.acquired.lock().unwrap();
        if let Some(existing) = acquired.get(call_id) {
            return Ok(existing.clone());
        }
        let media = LocalMedia {
            audio: MediaTrack::new(format!("audio:{}", call_id), false),
            video: match kind {
                CallKind::Video => Some(MediaTrack::new(format!("video:{}", call_id), true)),
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
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(error);
        }
        let track = MediaTrack::new(format!("video:{}:{}", source_label, call_id), true);
        if let Some(media) = self.acquired.lock().unwrap().get_mut(call_id) {
            media.video = Some(track.clone());
        }
        Ok(track)
    }

    fn release(&self, call_id: &CallId) {
        self.acquired.lock().unwrap().remove(call_id);
        self.released.lock().unwrap().push(call_id.clone());
    }
}
