use crate::{session::recovery::QualityTier, CallId, TrackId, UserId};
use serde::{Deserialize, Serialize};

/// SessionEvent is the single outbound event stream of the orchestrator.
/// UI layers and the recovery supervisor subscribe to it instead of
/// registering per-event callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SessionEvent {
    /// Local capture is live and attached to the session
    LocalStream {
        call_id: CallId,
        timestamp: u64,
        track_ids: Vec<TrackId>,
    },
    /// A remote track started flowing
    RemoteStream {
        call_id: CallId,
        timestamp: u64,
        track_id: TrackId,
        video: bool,
    },
    /// An incoming call is ringing on this device
    Ringing {
        call_id: CallId,
        timestamp: u64,
        partner_id: UserId,
        video: bool,
    },
    /// First media-flow confirmation for this call
    Connected { call_id: CallId, timestamp: u64 },
    /// Connection degraded, renegotiation in progress
    Reconnecting {
        call_id: CallId,
        timestamp: u64,
        attempt: u32,
    },
    /// Terminal failure
    Failed {
        call_id: CallId,
        timestamp: u64,
        reason: String,
    },
    /// Terminal hangup
    Ended {
        call_id: CallId,
        timestamp: u64,
        reason: Option<String>,
    },
    /// Connection quality tier changed
    Quality {
        call_id: CallId,
        timestamp: u64,
        tier: QualityTier,
    },
    /// Group roster additions/removals
    ParticipantJoined {
        call_id: CallId,
        timestamp: u64,
        user_id: UserId,
    },
    ParticipantLeft {
        call_id: CallId,
        timestamp: u64,
        user_id: UserId,
    },
}

impl SessionEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            SessionEvent::LocalStream { call_id, .. } => call_id,
            SessionEvent::RemoteStream { call_id, .. } => call_id,
            SessionEvent::Ringing { call_id, .. } => call_id,
            SessionEvent::Connected { call_id, .. } => call_id,
            SessionEvent::Reconnecting { call_id, .. } => call_id,
            SessionEvent::Failed { call_id, .. } => call_id,
            SessionEvent::Ended { call_id, .. } => call_id,
            SessionEvent::Quality { call_id, .. } => call_id,
            SessionEvent::ParticipantJoined { call_id, .. } => call_id,
            SessionEvent::ParticipantLeft { call_id, .. } => call_id,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;
