use super::*;
use crate::{
    media::peer::{IceState, LinkStats},
    session::QualityTier,
};
use std::collections::VecDeque;

#[tokio::test]
async fn transient_blip_is_not_a_disconnect() {
    let harness = harness();
    let mut config = fast_config();
    config.recovery.sample_interval_ms = 50;
    let alice = harness.party_with("alice", config, None).await;
    let bob = harness.party_with("bob", fast_config(), None).await;
    let mut alice_events = alice.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let (alice_session, _bob_session) = connect_pair(&alice, &bob).await;
    let peer = alice.peers.peer_for(&alice_session.call_id).unwrap();

    // down for well under the confirmation window, then back
    peer.set_ice_state(IceState::Disconnected);
    tokio::time::sleep(Duration::from_millis(60)).await;
    peer.set_ice_state(IceState::Connected);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(alice_session.state(), SessionState::Connected);
    while let Ok(event) = alice_events.try_recv() {
        buffer.push_back(event);
    }
    assert!(!buffer
        .iter()
        .any(|event| matches!(event, SessionEvent::Reconnecting { .. })));
}

#[tokio::test]
async fn confirmed_disconnect_renegotiates_in_place() {
    let harness = harness();
    let alice = harness.party_with("alice", fast_config(), None).await;
    let bob = harness.party_with("bob", fast_config(), None).await;
    let mut alice_events = alice.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let (alice_session, _bob_session) = connect_pair(&alice, &bob).await;
    let call_id = alice_session.call_id.clone();
    let started_at = harness
        .store
        .get(&call_id)
        .await
        .unwrap()
        .unwrap()
        .started_at;
    // drain setup events so the next connected event is the recovery one
    while alice_events.try_recv().is_ok() {}

    let peer = alice.peers.peer_for(&call_id).unwrap();
    peer.set_ice_state(IceState::Disconnected);

    wait_for_event(&mut alice_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Reconnecting { attempt: 1, .. })
    })
    .await
    .expect("reconnecting event");
    wait_for_event(&mut alice_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Connected { .. })
    })
    .await
    .expect("recovered");

    assert_eq!(alice_session.state(), SessionState::Connected);
    // same call, same record: no new id, started_at untouched
    let record = harness.store.get(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Active);
    assert_eq!(record.started_at, started_at);
}

#[tokio::test]
async fn exhausted_retries_fail_the_call() {
    let harness = harness();
    let alice = harness.party_with("alice", fast_config(), None).await;
    let bob = harness.party_with("bob", fast_config(), None).await;
    let mut alice_events = alice.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let (alice_session, _bob_session) = connect_pair(&alice, &bob).await;
    let call_id = alice_session.call_id.clone();

    let peer = alice.peers.peer_for(&call_id).unwrap();
    // answers no longer bring the transport back
    peer.set_auto_connect(false);
    peer.set_ice_state(IceState::Failed);

    let failed = wait_for_event(&mut alice_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Failed { .. })
    })
    .await
    .expect("failed event after retry budget");
    assert_eq!(failed.call_id(), &call_id);

    assert_eq!(alice_session.state(), SessionState::Failed);
    assert!(wait_for_status(&harness.store, &call_id, CallStatus::Ended).await);
    assert!(alice.orchestrator.session(&call_id).is_none());
}

#[tokio::test]
async fn heartbeat_writes_liveness_while_connected() {
    let harness = harness();
    let alice = harness.party_with("alice", fast_config(), None).await;
    let bob = harness.party_with("bob", fast_config(), None).await;

    let (alice_session, _bob_session) = connect_pair(&alice, &bob).await;
    let call_id = alice_session.call_id.clone();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let record = harness.store.get(&call_id).await.unwrap().unwrap();
    assert!(record.heartbeat_at.is_some());
    // heartbeats observe liveness, they never end calls
    assert_eq!(record.status, CallStatus::Active);
    assert_eq!(alice_session.state(), SessionState::Connected);
}

#[tokio::test]
async fn quality_tier_changes_are_reported() {
    let harness = harness();
    let alice = harness.party_with("alice", fast_config(), None).await;
    let bob = harness.party_with("bob", fast_config(), None).await;
    let mut alice_events = alice.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let (alice_session, _bob_session) = connect_pair(&alice, &bob).await;
    let peer = alice.peers.peer_for(&alice_session.call_id).unwrap();

    wait_for_event(&mut alice_events, &mut buffer, |event| {
        matches!(
            event,
            SessionEvent::Quality {
                tier: QualityTier::Excellent,
                ..
            }
        )
    })
    .await
    .expect("clean link reported first");

    peer.set_stats(LinkStats {
        packet_loss_pct: 10.0,
        rtt_ms: 60,
    });
    wait_for_event(&mut alice_events, &mut buffer, |event| {
        matches!(
            event,
            SessionEvent::Quality {
                tier: QualityTier::Fair,
                ..
            }
        )
    })
    .await
    .expect("degraded link reported");
}
