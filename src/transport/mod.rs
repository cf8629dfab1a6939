use crate::{
    error::CallError,
    model::{CallRecord, CallUpdate, ParticipantRow, RecordChange},
    CallId, UserId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{MemoryCallStore, MemoryRosterStore, MemorySignalingBus};

/// Negotiation data or control instruction exchanged between two call
/// parties. Transient; never persisted beyond in-flight delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: Option<String>,
        rejected: bool,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    },
    End {
        reason: Option<String>,
    },
    Reject {},
    Dtmf {
        digit: char,
    },
    /// Mid-call track addition; the remote side auto-accepts.
    VideoUpgrade {
        sdp: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub call_id: CallId,
    pub from_user: UserId,
    pub to_user: UserId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(call_id: CallId, from_user: UserId, to_user: UserId, payload: SignalPayload) -> Self {
        Self {
            call_id,
            from_user,
            to_user,
            payload,
        }
    }
}

pub type SignalReceiver = mpsc::UnboundedReceiver<SignalEnvelope>;
pub type RecordChangeReceiver = mpsc::UnboundedReceiver<RecordChange>;

/// Publish/subscribe signaling channel keyed by destination user.
/// At-most-once delivery; no ordering guarantee across channels.
#[async_trait]
pub trait SignalingBus: Send + Sync {
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), CallError>;
    fn subscribe(&self, user_id: &UserId) -> SignalReceiver;
}

/// Persisted call record store. Reads arrive as row-change notifications
/// filtered by involved user; writes are partial-field updates. No
/// cross-row transactions required.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert(&self, record: CallRecord) -> Result<(), CallError>;
    async fn update(&self, call_id: &CallId, update: CallUpdate) -> Result<(), CallError>;
    async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError>;
    async fn find_parked(&self, slot: &str) -> Result<Option<CallRecord>, CallError>;
    fn subscribe(&self, user_id: &UserId) -> RecordChangeReceiver;
}

/// Group roster rows keyed by (call id, user id).
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn list_active(&self, call_id: &CallId) -> Result<Vec<ParticipantRow>, CallError>;
    async fn upsert(&self, row: ParticipantRow) -> Result<(), CallError>;
}
