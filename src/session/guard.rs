use crate::{session::CallSession, CallId, UserId};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
};
use tracing::debug;

/// Answer-state visibility across co-located call stacks. A native shell
/// (system call UI, second in-process stack) reports through this seam so
/// the orchestrator can skip duplicate record mutations at answer time.
pub trait HostBridge: Send + Sync {
    fn is_accepted_by_host(&self, call_id: &CallId) -> bool;
    fn clear(&self, call_id: &CallId);
}

/// Bridge for deployments without a co-located stack.
#[derive(Default)]
pub struct NoopHostBridge;

impl HostBridge for NoopHostBridge {
    fn is_accepted_by_host(&self, _call_id: &CallId) -> bool {
        false
    }

    fn clear(&self, _call_id: &CallId) {}
}

/// Settable bridge backed by a flag set. Embedding shells mark a call when
/// their native layer accepted it first.
#[derive(Default)]
pub struct SharedHostBridge {
    accepted: Mutex<HashSet<CallId>>,
}

impl SharedHostBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_accepted(&self, call_id: &CallId) {
        self.accepted.lock().unwrap().insert(call_id.clone());
    }
}

impl HostBridge for SharedHostBridge {
    fn is_accepted_by_host(&self, call_id: &CallId) -> bool {
        self.accepted.lock().unwrap().contains(call_id)
    }

    fn clear(&self, call_id: &CallId) {
        self.accepted.lock().unwrap().remove(call_id);
    }
}

/// Registry of live sessions keyed by call id. Registration is a single
/// check-and-insert under one lock, so two racing setup paths for the same
/// call converge on one session. Holds weak existence views only; the
/// orchestrator owns the strong references until teardown.
pub struct PresenceGuard {
    sessions: Mutex<HashMap<CallId, Weak<CallSession>>>,
    host_bridge: Arc<dyn HostBridge>,
}

impl PresenceGuard {
    pub fn new(host_bridge: Arc<dyn HostBridge>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            host_bridge,
        })
    }

    pub fn get_existing(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(call_id)
            .and_then(Weak::upgrade)
    }

    pub fn has_active_call(&self, call_id: &CallId) -> bool {
        self.get_existing(call_id)
            .map(|s| !s.state().is_terminal())
            .unwrap_or(false)
    }

    /// Atomic check-and-register. Returns the already-registered session
    /// when the call id is taken; the caller must discard its own and use
    /// the winner.
    pub fn register(&self, session: Arc<CallSession>) -> Result<(), Arc<CallSession>> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(&session.call_id).and_then(Weak::upgrade) {
            if !existing.state().is_terminal() {
                debug!(call_id = session.call_id, "duplicate session registration");
                return Err(existing);
            }
        }
        sessions.insert(session.call_id.clone(), Arc::downgrade(&session));
        Ok(())
    }

    /// The live non-terminal session toward `partner`, if any. Enforces one
    /// ringing-or-active call per user pair.
    pub fn find_by_partner(&self, partner: &UserId) -> Option<Arc<CallSession>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .find(|s| s.partner_id() == *partner && !s.state().is_terminal())
    }

    pub fn clear(&self, call_id: &CallId) {
        self.sessions.lock().unwrap().remove(call_id);
        self.host_bridge.clear(call_id);
    }

    pub fn accepted_by_host(&self, call_id: &CallId) -> bool {
        self.host_bridge.is_accepted_by_host(call_id)
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.state().is_terminal())
            .count()
    }
}
