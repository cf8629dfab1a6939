use super::{
    CallStore, RecordChangeReceiver, RosterStore, SignalEnvelope, SignalReceiver, SignalingBus,
};
use crate::{
    error::CallError,
    model::{CallRecord, CallUpdate, ParticipantRow, RecordChange},
    CallId, UserId,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use tracing::debug;

/// In-process signaling bus. At-most-once: envelopes addressed to a user
/// with no live subscriber are dropped.
#[derive(Default)]
pub struct MemorySignalingBus {
    subscribers: Mutex<HashMap<UserId, Vec<mpsc::UnboundedSender<SignalEnvelope>>>>,
}

impl MemorySignalingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SignalingBus for MemorySignalingBus {
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        let mut subscribers = self.subscribers.lock().unwrap();
        let senders = match subscribers.get_mut(&envelope.to_user) {
            Some(senders) => senders,
            None => {
                debug!(
                    call_id = envelope.call_id,
                    to_user = envelope.to_user,
                    "dropping envelope, no subscriber"
                );
                return Ok(());
            }
        };
        senders.retain(|sender| sender.send(envelope.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self, user_id: &UserId) -> SignalReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(user_id.clone())
            .or_default()
            .push(sender);
        receiver
    }
}

struct CallStoreInner {
    rows: HashMap<CallId, CallRecord>,
    watchers: Vec<(UserId, mpsc::UnboundedSender<RecordChange>)>,
}

/// In-process call record store with row-change fan-out.
pub struct MemoryCallStore {
    inner: Mutex<CallStoreInner>,
}

impl MemoryCallStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CallStoreInner {
                rows: HashMap::new(),
                watchers: Vec::new(),
            }),
        })
    }

    fn notify(inner: &mut CallStoreInner, change: RecordChange) {
        let record = change.record().clone();
        inner.watchers.retain(|(user_id, sender)| {
            if !record.involves(user_id) {
                return true;
            }
            sender.send(change.clone()).is_ok()
        });
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn insert(&self, record: CallRecord) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.contains_key(&record.id) {
            return Err(CallError::RecordWriteFailed(format!(
                "duplicate call id: {}",
                record.id
            )));
        }
        inner.rows.insert(record.id.clone(), record.clone());
        Self::notify(&mut inner, RecordChange::Inserted(record));
        Ok(())
    }

    async fn update(&self, call_id: &CallId, update: CallUpdate) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        let record = match inner.rows.get_mut(call_id) {
            Some(record) => {
                update.apply(record);
                record.clone()
            }
            None => {
                return Err(CallError::RecordWriteFailed(format!(
                    "no such call: {}",
                    call_id
                )))
            }
        };
        Self::notify(&mut inner, RecordChange::Updated(record));
        Ok(())
    }

    async fn get(&self, call_id: &CallId) -> Result<Option<CallRecord>, CallError> {
        Ok(self.inner.lock().unwrap().rows.get(call_id).cloned())
    }

    async fn find_parked(&self, slot: &str) -> Result<Option<CallRecord>, CallError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .values()
            .find(|r| r.parked_slot.as_deref() == Some(slot))
            .cloned())
    }

    fn subscribe(&self, user_id: &UserId) -> RecordChangeReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .watchers
            .push((user_id.clone(), sender));
        receiver
    }
}

/// In-process roster store.
#[derive(Default)]
pub struct MemoryRosterStore {
    rows: Mutex<HashMap<(CallId, UserId), ParticipantRow>>,
}

impl MemoryRosterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn list_active(&self, call_id: &CallId) -> Result<Vec<ParticipantRow>, CallError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| &row.call_id == call_id && row.is_active)
            .cloned()
            .collect())
    }

    async fn upsert(&self, row: ParticipantRow) -> Result<(), CallError> {
        self.rows
            .lock()
            .unwrap()
            .insert((row.call_id.clone(), row.user_id.clone()), row);
        Ok(())
    }
}
