use super::*;
use crate::{
    model::CallRecord,
    session::{PresenceGuard, Role, SharedHostBridge},
    transport::{SignalEnvelope, SignalPayload, SignalingBus},
};
use std::collections::VecDeque;

#[tokio::test]
async fn second_dial_to_same_partner_resumes_the_session() {
    let harness = harness();
    let alice = harness.party("alice").await;
    let _bob = harness.party("bob").await;

    let first = alice
        .orchestrator
        .initiate(&"bob".to_string(), CallKind::Voice)
        .await
        .unwrap();
    let second = alice
        .orchestrator
        .initiate(&"bob".to_string(), CallKind::Voice)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(alice.orchestrator.guard().live_count(), 1);
    // only one peer link was ever built
    assert_eq!(alice.peers.created_count(), 1);
}

#[tokio::test]
async fn duplicate_ring_notifications_collapse_to_one_session() {
    let harness = harness();
    let alice = harness.party("alice").await;
    let bob = harness.party("bob").await;
    let mut bob_events = bob.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let session = alice
        .orchestrator
        .initiate(&"bob".to_string(), CallKind::Voice)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Ringing { .. })
    })
    .await
    .expect("first ring");

    // a redundant row touch replays the ringing notification
    harness
        .store
        .update(&session.call_id, crate::model::CallUpdate::status(CallStatus::Ringing))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.orchestrator.guard().live_count(), 1);
    while let Ok(event) = bob_events.try_recv() {
        buffer.push_back(event);
    }
    assert!(!buffer
        .iter()
        .any(|event| matches!(event, SessionEvent::Ringing { .. })));
}

#[tokio::test]
async fn simultaneous_dial_inbound_wins_on_lower_id() {
    let harness = harness();
    let alice = harness.party("alice").await;
    let _bob = harness.party("bob").await;
    let mut alice_events = alice.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let outbound = alice
        .orchestrator
        .initiate(&"bob".to_string(), CallKind::Voice)
        .await
        .unwrap();

    // bob dialed at the same moment; his call id sorts below the uuid
    let glare_id = "!glare".to_string();
    harness
        .store
        .insert(CallRecord::new(
            glare_id.clone(),
            "bob".to_string(),
            "alice".to_string(),
            CallKind::Voice,
        ))
        .await
        .unwrap();
    let ringing = wait_for_event(&mut alice_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Ringing { .. })
    })
    .await
    .expect("inbound leg rings despite the outbound dial");
    assert_eq!(ringing.call_id(), &glare_id);

    harness
        .bus
        .publish(SignalEnvelope::new(
            glare_id.clone(),
            "bob".to_string(),
            "alice".to_string(),
            SignalPayload::Offer {
                sdp: "offer:glare".to_string(),
            },
        ))
        .await
        .unwrap();
    let winner = alice.orchestrator.answer(&glare_id).await.unwrap();
    assert!(wait_for_state(&winner, SessionState::Connected).await);

    // the losing outbound leg is closed out as missed
    assert!(wait_for_state(&outbound, SessionState::Ended).await);
    assert!(wait_for_status(&harness.store, &outbound.call_id, CallStatus::Missed).await);
    assert!(wait_for_status(&harness.store, &glare_id, CallStatus::Active).await);
}

#[tokio::test]
async fn simultaneous_dial_outbound_wins_on_lower_id() {
    let harness = harness();
    let alice = harness.party("alice").await;
    let bob = harness.party("bob").await;
    let mut alice_events = alice.orchestrator.subscribe();
    let mut bob_events = bob.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let outbound = alice
        .orchestrator
        .initiate(&"bob".to_string(), CallKind::Voice)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Ringing { .. })
    })
    .await
    .expect("bob rings for the outbound call");

    // bob's simultaneous dial sorts above the uuid, so the outbound leg wins
    let glare_id = "zzz-glare".to_string();
    harness
        .store
        .insert(CallRecord::new(
            glare_id.clone(),
            "bob".to_string(),
            "alice".to_string(),
            CallKind::Voice,
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    bob.orchestrator.answer(&outbound.call_id).await.unwrap();
    assert!(wait_for_state(&outbound, SessionState::Connected).await);

    assert!(wait_for_status(&harness.store, &glare_id, CallStatus::Missed).await);
    // the losing inbound never surfaced to the user
    let mut alice_buffer = VecDeque::new();
    while let Ok(event) = alice_events.try_recv() {
        alice_buffer.push_back(event);
    }
    assert!(!alice_buffer
        .iter()
        .any(|event| matches!(event, SessionEvent::Ringing { .. })));
}

#[tokio::test]
async fn host_accepted_answer_skips_the_record_write() {
    let harness = harness();
    let bridge = SharedHostBridge::new();
    let bob = harness
        .party_with("bob", Config::default(), Some(bridge.clone()))
        .await;
    let mut bob_events = bob.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let call_id = "host-call".to_string();
    harness
        .store
        .insert(CallRecord::new(
            call_id.clone(),
            "carol".to_string(),
            "bob".to_string(),
            CallKind::Voice,
        ))
        .await
        .unwrap();
    wait_for_event(&mut bob_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Ringing { .. })
    })
    .await
    .expect("bob rings");
    harness
        .bus
        .publish(SignalEnvelope::new(
            call_id.clone(),
            "carol".to_string(),
            "bob".to_string(),
            SignalPayload::Offer {
                sdp: "offer:carol".to_string(),
            },
        ))
        .await
        .unwrap();

    // the native layer picked up first and owns the record mutation
    bridge.mark_accepted(&call_id);
    let session = bob.orchestrator.answer(&call_id).await.unwrap();
    assert!(wait_for_state(&session, SessionState::Connected).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = harness.store.get(&call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ringing);
}

#[tokio::test]
async fn unassisted_answer_writes_the_active_status() {
    let harness = harness();
    let bob = harness.party("bob").await;
    let mut bob_events = bob.orchestrator.subscribe();
    let mut buffer = VecDeque::new();

    let call_id = "plain-call".to_string();
    harness
        .store
        .insert(CallRecord::new(
            call_id.clone(),
            "carol".to_string(),
            "bob".to_string(),
            CallKind::Voice,
        ))
        .await
        .unwrap();
    wait_for_event(&mut bob_events, &mut buffer, |event| {
        matches!(event, SessionEvent::Ringing { .. })
    })
    .await
    .expect("bob rings");
    harness
        .bus
        .publish(SignalEnvelope::new(
            call_id.clone(),
            "carol".to_string(),
            "bob".to_string(),
            SignalPayload::Offer {
                sdp: "offer:carol".to_string(),
            },
        ))
        .await
        .unwrap();

    let session = bob.orchestrator.answer(&call_id).await.unwrap();
    assert!(wait_for_state(&session, SessionState::Connected).await);
    assert!(wait_for_status(&harness.store, &call_id, CallStatus::Active).await);
}

#[tokio::test]
async fn registration_is_first_writer_wins() {
    let guard = PresenceGuard::new(Arc::new(crate::session::NoopHostBridge));
    let first = CallSession::new_for_test("c1", "bob");
    assert!(guard.register(first.clone()).is_ok());

    let duplicate = CallSession::new_for_test("c1", "bob");
    let existing = guard.register(duplicate).unwrap_err();
    assert!(Arc::ptr_eq(&existing, &first));
    assert_eq!(first.role, Role::Initiator);
    assert_eq!(guard.live_count(), 1);

    // a terminal leftover no longer blocks the id; the guard tracks
    // existence only, the owner keeps the strong reference
    first.transition(SessionState::Ended);
    let fresh = CallSession::new_for_test("c1", "bob");
    assert!(guard.register(fresh.clone()).is_ok());
    assert_eq!(guard.live_count(), 1);
    let found = guard.get_existing(&"c1".to_string()).expect("fresh session visible");
    assert!(Arc::ptr_eq(&found, &fresh));
}
