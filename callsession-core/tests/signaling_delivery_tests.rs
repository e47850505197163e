//! Relay delivery edge cases: duplicates, reordering, late joiners and
//! conflicting descriptions

use callsession_core::{
    CallEvent, CallId, CallManager, CallManagerConfig, CallRole, CallState, ErrorKind,
    EventReceiver, InMemoryRelay, RelayEndpoint, SignalingPayload, SimulatedTransportFactory,
    SyntheticCaptureBackend,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Party {
    manager: CallManager,
    peers: Arc<SimulatedTransportFactory>,
    relay: RelayEndpoint,
}

fn party(relay: RelayEndpoint) -> Party {
    let peers = Arc::new(SimulatedTransportFactory::new());
    let manager = CallManager::new(
        CallManagerConfig::default(),
        Arc::new(SyntheticCaptureBackend::new()),
        Arc::new(relay.clone()),
        peers.clone(),
    );
    Party {
        manager,
        peers,
        relay,
    }
}

fn parties() -> (Party, Party) {
    let (customer, technician) = InMemoryRelay::pair();
    (party(customer), party(technician))
}

async fn wait_for(
    events: &mut EventReceiver,
    pred: impl Fn(&CallEvent) -> bool,
) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            let hit = pred(&event);
            seen.push(event);
            if hit {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "event not observed; saw {seen:?}");
    seen
}

fn is_connected(event: &CallEvent) -> bool {
    matches!(event, CallEvent::Connected { .. })
}

fn count_connected(events: &mut EventReceiver) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if is_connected(&event) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn duplicate_delivery_connects_once() {
    let (customer, technician) = parties();
    customer.relay.set_duplicate_delivery(true);
    let call = CallId::new("dup-1");
    let mut customer_events = customer.manager.subscribe(&call);
    let mut technician_events = technician.manager.subscribe(&call);

    customer
        .manager
        .initiate(call.clone(), CallRole::Offerer, true, true)
        .await
        .unwrap();
    technician
        .manager
        .initiate(call.clone(), CallRole::Answerer, true, true)
        .await
        .unwrap();

    wait_for(&mut customer_events, is_connected).await;
    wait_for(&mut technician_events, is_connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(count_connected(&mut customer_events), 0);
    assert_eq!(count_connected(&mut technician_events), 0);

    let answerer = technician.peers.for_call(&call).unwrap();
    assert_eq!(answerer.answers_created(), 1);
    assert_eq!(answerer.remote_candidate_count(), 2);
    let offerer = customer.peers.for_call(&call).unwrap();
    assert_eq!(offerer.offers_created(), 1);
    assert_eq!(offerer.remote_candidate_count(), 2);
    assert!(customer.relay.frames_delivered() >= 12);
}

#[tokio::test]
async fn candidates_ahead_of_offer_still_connect() {
    let (customer, technician) = parties();
    let call = CallId::new("reorder-1");
    let mut customer_events = customer.manager.subscribe(&call);
    let mut technician_events = technician.manager.subscribe(&call);

    customer.relay.set_hold_deliveries(true);
    customer
        .manager
        .initiate(call.clone(), CallRole::Offerer, true, true)
        .await
        .unwrap();
    technician
        .manager
        .initiate(call.clone(), CallRole::Answerer, true, true)
        .await
        .unwrap();

    // offer plus its two candidates
    tokio::time::timeout(Duration::from_secs(5), async {
        while customer.relay.held_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        technician.manager.call_state(&call),
        Some(CallState::Negotiating)
    );

    customer.relay.set_hold_deliveries(false);
    customer.relay.release_held_reversed();

    wait_for(&mut technician_events, is_connected).await;
    wait_for(&mut customer_events, is_connected).await;
    assert_eq!(
        technician.peers.for_call(&call).unwrap().remote_candidate_count(),
        2
    );
}

#[tokio::test]
async fn answerer_joining_late_receives_earlier_offer() {
    let (customer, technician) = parties();
    let call = CallId::new("late-1");
    let mut customer_events = customer.manager.subscribe(&call);

    customer
        .manager
        .initiate(call.clone(), CallRole::Offerer, false, true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(customer.manager.call_state(&call), Some(CallState::Negotiating));

    let mut technician_events = technician.manager.subscribe(&call);
    technician
        .manager
        .initiate(call.clone(), CallRole::Answerer, false, true)
        .await
        .unwrap();

    wait_for(&mut technician_events, is_connected).await;
    wait_for(&mut customer_events, is_connected).await;
}

#[tokio::test]
async fn conflicting_second_offer_is_ignored() {
    let (customer, technician) = parties();
    let call = CallId::new("conflict-1");
    let mut customer_events = customer.manager.subscribe(&call);
    let mut technician_events = technician.manager.subscribe(&call);

    customer
        .manager
        .initiate(call.clone(), CallRole::Offerer, true, true)
        .await
        .unwrap();
    technician
        .manager
        .initiate(call.clone(), CallRole::Answerer, true, true)
        .await
        .unwrap();
    wait_for(&mut customer_events, is_connected).await;
    wait_for(&mut technician_events, is_connected).await;

    let rogue = "v=0\r\no=- 99 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                 m=audio 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:callsession rogue-audio\r\n";
    assert!(technician.manager.handle_signaling(
        &call,
        SignalingPayload::Offer {
            sdp: rogue.to_string()
        }
    ));

    let seen = wait_for(&mut technician_events, |e| matches!(e, CallEvent::Error { .. })).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, CallEvent::StateChanged { .. })));
    assert_eq!(technician.manager.call_state(&call), Some(CallState::Connected));
    assert_eq!(technician.peers.for_call(&call).unwrap().answers_created(), 1);
}

#[tokio::test]
async fn malformed_offer_fails_answerer() {
    let (_customer, technician) = parties();
    let call = CallId::new("garbage-1");
    let mut events = technician.manager.subscribe(&call);

    technician
        .manager
        .initiate(call.clone(), CallRole::Answerer, true, true)
        .await
        .unwrap();
    assert!(technician.manager.handle_signaling(
        &call,
        SignalingPayload::Offer {
            sdp: "this is not a session description".to_string()
        }
    ));

    let seen = wait_for(&mut events, |e| {
        matches!(
            e,
            CallEvent::StateChanged {
                to: CallState::Failed,
                ..
            }
        )
    })
    .await;
    assert!(seen.contains(&CallEvent::Error {
        call_id: call.clone(),
        kind: ErrorKind::NegotiationFailed,
    }));
    assert_eq!(technician.manager.call_state(&call), Some(CallState::Failed));
    assert!(technician.peers.for_call(&call).unwrap().is_closed());
}
