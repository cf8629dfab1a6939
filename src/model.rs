use crate::{CallId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Missed,
    Rejected,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Missed | CallStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Signaling,
    Connected,
    Ended,
}

/// The persisted call row. Externally owned; the orchestrator treats it as
/// the source of truth for cross-device sync and only ever status-terminates
/// it, never deletes it.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub conversation_id: Option<String>,
    pub kind: CallKind,
    pub is_group: bool,
    pub status: CallStatus,
    pub transport_state: TransportState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// seconds, derived from started_at on termination
    pub duration: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub parked_slot: Option<String>,
}

impl CallRecord {
    pub fn new(id: CallId, caller_id: UserId, receiver_id: UserId, kind: CallKind) -> Self {
        Self {
            id,
            caller_id,
            receiver_id,
            conversation_id: None,
            kind,
            is_group: false,
            status: CallStatus::Ringing,
            transport_state: TransportState::Signaling,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration: None,
            heartbeat_at: None,
            parked_slot: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: String) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_group(mut self, is_group: bool) -> Self {
        self.is_group = is_group;
        self
    }

    /// The other party from `user`'s perspective.
    pub fn partner_of(&self, user: &UserId) -> &UserId {
        if &self.caller_id == user {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }
}

/// Partial-field update applied to a persisted call row. Absent fields are
/// left untouched by the store.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub transport_state: Option<TransportState>,
    pub kind: Option<CallKind>,
    pub receiver_id: Option<UserId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Some("") clears the slot
    pub parked_slot: Option<String>,
}

impl CallUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn terminated(status: CallStatus, started_at: Option<DateTime<Utc>>) -> Self {
        let ended_at = Utc::now();
        let duration = started_at.map(|s| (ended_at - s).num_seconds().max(0) as u32);
        Self {
            status: Some(status),
            transport_state: Some(TransportState::Ended),
            ended_at: Some(ended_at),
            duration,
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut CallRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(transport_state) = self.transport_state {
            record.transport_state = transport_state;
        }
        if let Some(kind) = self.kind {
            record.kind = kind;
        }
        if let Some(ref receiver_id) = self.receiver_id {
            record.receiver_id = receiver_id.clone();
        }
        if let Some(started_at) = self.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(ended_at) = self.ended_at {
            record.ended_at = Some(ended_at);
        }
        if let Some(duration) = self.duration {
            record.duration = Some(duration);
        }
        if let Some(heartbeat_at) = self.heartbeat_at {
            record.heartbeat_at = Some(heartbeat_at);
        }
        if let Some(ref slot) = self.parked_slot {
            if slot.is_empty() {
                record.parked_slot = None;
            } else {
                record.parked_slot = Some(slot.clone());
            }
        }
    }
}

/// Row-change notification delivered by the call store subscription.
#[derive(Debug, Clone)]
pub enum RecordChange {
    Inserted(CallRecord),
    Updated(CallRecord),
}

impl RecordChange {
    pub fn record(&self) -> &CallRecord {
        match self {
            RecordChange::Inserted(r) => r,
            RecordChange::Updated(r) => r,
        }
    }
}

/// Group roster row, keyed by (call_id, user_id).
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRow {
    pub call_id: CallId,
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
}
