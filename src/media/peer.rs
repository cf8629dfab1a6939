use super::capture::MediaTrack;
use crate::TrackId;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// States that count toward the disconnect confirmation window.
    pub fn is_down(&self) -> bool {
        matches!(self, IceState::Disconnected | IceState::Failed)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceState(IceState),
    RemoteTrack { track_id: TrackId, video: bool },
    /// A track was added or removed; the owner must renegotiate.
    NegotiationNeeded,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    pub packet_loss_pct: f32,
    pub rtt_ms: u32,
}

pub type PeerEventReceiver = broadcast::Receiver<PeerEvent>;

/// One peer connection's negotiation surface. The orchestrator drives it;
/// implementations must not initiate signaling on their own.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self, remote_offer: &str) -> Result<String>;
    async fn accept_answer(&self, remote_answer: &str) -> Result<()>;
    async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    ) -> Result<()>;
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;
    async fn remove_track(&self, track_id: &TrackId) -> Result<()>;
    /// Swap the sender's payload without renegotiation.
    async fn replace_track(&self, old_id: &TrackId, track: &MediaTrack) -> Result<()>;
    async fn stats(&self) -> Result<LinkStats>;
    fn ice_state(&self) -> IceState;
    fn subscribe(&self) -> PeerEventReceiver;
    async fn close(&self) -> Result<()>;
}

/// Creates peer transports, one per (call, remote participant).
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, id: &str) -> Result<Arc<dyn PeerTransport>>;
}
