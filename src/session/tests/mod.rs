use crate::{
    config::Config,
    event::{EventReceiver, SessionEvent},
    model::{CallKind, CallStatus},
    session::{CallSession, HostBridge, Orchestrator, OrchestratorBuilder, SessionState},
    testing::{FakeCaptureSource, FakePeerFactory},
    transport::{CallStore, MemoryCallStore, MemoryRosterStore, MemorySignalingBus},
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::time::timeout;

mod dedup_test;
mod recovery_test;

pub(crate) struct Harness {
    pub bus: Arc<MemorySignalingBus>,
    pub store: Arc<MemoryCallStore>,
    pub roster: Arc<MemoryRosterStore>,
}

pub(crate) struct Party {
    pub orchestrator: Arc<Orchestrator>,
    pub peers: Arc<FakePeerFactory>,
    pub capture: Arc<FakeCaptureSource>,
}

pub(crate) fn harness() -> Harness {
    Harness {
        bus: MemorySignalingBus::new(),
        store: MemoryCallStore::new(),
        roster: MemoryRosterStore::new(),
    }
}

impl Harness {
    pub(crate) async fn party(&self, user: &str) -> Party {
        self.party_with(user, Config::default(), None).await
    }

    pub(crate) async fn party_with(
        &self,
        user: &str,
        config: Config,
        host_bridge: Option<Arc<dyn HostBridge>>,
    ) -> Party {
        let peers = FakePeerFactory::new();
        let capture = FakeCaptureSource::new();
        let mut builder = OrchestratorBuilder::new()
            .with_config(Arc::new(config))
            .with_bus(self.bus.clone())
            .with_store(self.store.clone())
            .with_roster(self.roster.clone())
            .with_capture(capture.clone())
            .with_peers(peers.clone());
        if let Some(host_bridge) = host_bridge {
            builder = builder.with_host_bridge(host_bridge);
        }
        let orchestrator = builder.build();
        orchestrator.set_identity(user.to_string());
        let serving = orchestrator.clone();
        tokio::spawn(async move {
            serving.serve().await.ok();
        });
        // let the serve loop register its subscriptions before anyone dials
        tokio::time::sleep(Duration::from_millis(10)).await;
        Party {
            orchestrator,
            peers,
            capture,
        }
    }
}

/// Recovery timings scaled down so reconnect scenarios finish in
/// milliseconds instead of minutes.
pub(crate) fn fast_config() -> Config {
    let mut config = Config::default();
    config.recovery.sample_interval_ms = 20;
    config.recovery.disconnect_threshold = 3;
    config.recovery.max_retries = 2;
    config.recovery.backoff_base_ms = 10;
    config.recovery.backoff_cap_ms = 40;
    config.recovery.heartbeat_interval_ms = 40;
    config.recovery.negotiation_timeout_ms = 500;
    config
}

pub(crate) async fn wait_for_event<F>(
    receiver: &mut EventReceiver,
    buffer: &mut VecDeque<SessionEvent>,
    predicate: F,
) -> Option<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool + Send,
{
    if let Some(pos) = buffer.iter().position(|event| predicate(event)) {
        return buffer.remove(pos);
    }

    timeout(Duration::from_secs(2), async {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if predicate(&event) {
                        return Some(event);
                    }
                    buffer.push_back(event);
                }
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

pub(crate) async fn wait_for_state(session: &Arc<CallSession>, state: SessionState) -> bool {
    timeout(Duration::from_secs(2), async {
        loop {
            if session.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or(false)
}

pub(crate) async fn wait_for_status(
    store: &Arc<MemoryCallStore>,
    call_id: &str,
    status: CallStatus,
) -> bool {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Some(record)) = store.get(&call_id.to_string()).await {
                if record.status == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or(false)
}

/// Dial from `alice` to `bob` and drive both legs to connected.
pub(crate) async fn connect_pair(alice: &Party, bob: &Party) -> (Arc<CallSession>, Arc<CallSession>) {
    let bob_id = bob.orchestrator.identity().unwrap();
    let mut bob_events = bob.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let session = alice
        .orchestrator
        .initiate(&bob_id, CallKind::Voice)
        .await
        .unwrap();
    let ringing = wait_for_event(&mut bob_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Ringing { .. })
    })
    .await
    .expect("bob should ring");
    assert_eq!(ringing.call_id(), &session.call_id);

    let bob_session = bob.orchestrator.answer(&session.call_id).await.unwrap();
    assert!(wait_for_state(&session, SessionState::Connected).await);
    assert!(wait_for_state(&bob_session, SessionState::Connected).await);
    (session, bob_session)
}
