//! Signaling relay client
//!
//! Carries offers, answers and ICE candidates between the two parties of a
//! call through an external relay addressed by call id.

use crate::types::{CallId, SignalingPayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The relay cannot be reached
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// A frame could not be encoded or decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Another subscription for the call is still open on this endpoint
    #[error("Already subscribed to call {0}")]
    AlreadySubscribed(CallId),
}

/// Inbound payload stream for one call
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// detaches it from the relay.
pub struct Subscription {
    call_id: CallId,
    receiver: mpsc::UnboundedReceiver<SignalingPayload>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription over a payload channel
    pub fn new(
        call_id: CallId,
        receiver: mpsc::UnboundedReceiver<SignalingPayload>,
        on_unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            call_id,
            receiver,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    /// Call this subscription is addressed to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Wait for the next inbound payload
    ///
    /// Returns `None` once the relay closed the stream.
    pub async fn recv(&mut self) -> Option<SignalingPayload> {
        self.receiver.recv().await
    }

    /// Detach from the relay
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(on_unsubscribe) = self.on_unsubscribe.take() {
            on_unsubscribe();
            tracing::debug!(call_id = %self.call_id, "Signaling subscription closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Signaling transport trait
///
/// Implement this for the relay in use (document store, websocket fan-out,
/// message queue...). Delivery is at-least-once with best-effort ordering per
/// call id; consumers must tolerate duplicates.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send a payload to the other party of `call_id`
    async fn send(&self, call_id: &CallId, payload: SignalingPayload) -> Result<(), SignalingError>;

    /// Receive payloads addressed to this party for `call_id`
    fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError>;
}

/// Relay client used by the call manager
pub struct SignalingHandler {
    transport: Arc<dyn SignalingTransport>,
    sent: AtomicU64,
    send_failures: AtomicU64,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    /// Send a payload for a call
    ///
    /// Failures are returned as-is; retry policy belongs to the caller.
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the payload
    #[tracing::instrument(skip(self, payload), fields(call_id = %call_id, payload = payload.kind()))]
    pub async fn send_payload(
        &self,
        call_id: &CallId,
        payload: SignalingPayload,
    ) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling payload");
        match self.transport.send(call_id, payload).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let failures = self.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, failures, "Signaling send failed");
                Err(e)
            }
        }
    }

    /// Open the inbound route for a call
    ///
    /// # Errors
    ///
    /// Returns error if the relay cannot be subscribed to
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError> {
        let subscription = self.transport.subscribe(call_id)?;
        tracing::debug!("Signaling subscription opened");
        Ok(subscription)
    }

    /// Payloads sent successfully
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Sends rejected by the relay
    #[must_use]
    pub fn send_failure_count(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }
}

// ============================================================================
// In-Memory Relay
// ============================================================================

enum Mailbox {
    /// Frames waiting for a subscriber
    Pending(Vec<String>),
    /// Live subscriber
    Subscribed {
        token: u64,
        sender: mpsc::UnboundedSender<SignalingPayload>,
    },
}

struct HeldFrame {
    side: usize,
    call_id: CallId,
    frame: String,
}

#[derive(Default)]
struct RelayHub {
    mailboxes: [Mutex<HashMap<CallId, Mailbox>>; 2],
    held: Mutex<Vec<HeldFrame>>,
    unavailable: AtomicBool,
    duplicate_delivery: AtomicBool,
    hold_deliveries: AtomicBool,
    next_token: AtomicU64,
    frames_delivered: AtomicU64,
}

impl RelayHub {
    fn ensure_available(&self) -> Result<(), SignalingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SignalingError::RelayUnavailable(
                "in-memory relay is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn deliver(&self, side: usize, call_id: &CallId, frame: String) {
        let mut mailboxes = self.mailboxes[side].lock();
        let mailbox = mailboxes
            .entry(call_id.clone())
            .or_insert_with(|| Mailbox::Pending(Vec::new()));

        match mailbox {
            Mailbox::Pending(frames) => frames.push(frame),
            Mailbox::Subscribed { sender, .. } => match SignalingPayload::from_json(&frame) {
                Ok(payload) => {
                    if sender.send(payload).is_err() {
                        *mailbox = Mailbox::Pending(vec![frame]);
                    }
                }
                Err(e) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Dropping undecodable relay frame");
                    return;
                }
            },
        }
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-process relay connecting two call parties
///
/// Payloads are carried as JSON frames. Frames addressed to a call nobody
/// has subscribed to yet are kept until a subscriber attaches, which is how
/// a document-store relay behaves when the callee opens the call late.
pub struct InMemoryRelay;

impl InMemoryRelay {
    /// Create two linked endpoints; what one sends the other receives
    #[must_use]
    pub fn pair() -> (RelayEndpoint, RelayEndpoint) {
        let hub = Arc::new(RelayHub::default());
        (
            RelayEndpoint {
                hub: Arc::clone(&hub),
                side: 0,
            },
            RelayEndpoint { hub, side: 1 },
        )
    }
}

/// One party's view of an [`InMemoryRelay`]
#[derive(Clone)]
pub struct RelayEndpoint {
    hub: Arc<RelayHub>,
    side: usize,
}

impl RelayEndpoint {
    fn peer_side(&self) -> usize {
        1 - self.side
    }

    /// Take the whole relay offline (or back online)
    pub fn set_available(&self, available: bool) {
        self.hub.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Deliver every frame twice
    pub fn set_duplicate_delivery(&self, duplicate: bool) {
        self.hub.duplicate_delivery.store(duplicate, Ordering::SeqCst);
    }

    /// Hold frames in the relay instead of delivering them
    pub fn set_hold_deliveries(&self, hold: bool) {
        self.hub.hold_deliveries.store(hold, Ordering::SeqCst);
    }

    /// Number of frames currently held
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.hub.held.lock().len()
    }

    /// Deliver held frames in the order they were sent
    pub fn release_held(&self) {
        let held = std::mem::take(&mut *self.hub.held.lock());
        for frame in held {
            self.hub.deliver(frame.side, &frame.call_id, frame.frame);
        }
    }

    /// Deliver held frames newest first
    pub fn release_held_reversed(&self) {
        let held = std::mem::take(&mut *self.hub.held.lock());
        for frame in held.into_iter().rev() {
            self.hub.deliver(frame.side, &frame.call_id, frame.frame);
        }
    }

    /// Frames handed to subscribers or mailboxes so far
    #[must_use]
    pub fn frames_delivered(&self) -> u64 {
        self.hub.frames_delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SignalingTransport for RelayEndpoint {
    async fn send(&self, call_id: &CallId, payload: SignalingPayload) -> Result<(), SignalingError> {
        self.hub.ensure_available()?;
        let frame = payload
            .to_json()
            .map_err(|e| SignalingError::InvalidPayload(e.to_string()))?;

        let copies = if self.hub.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            if self.hub.hold_deliveries.load(Ordering::SeqCst) {
                self.hub.held.lock().push(HeldFrame {
                    side: self.peer_side(),
                    call_id: call_id.clone(),
                    frame: frame.clone(),
                });
            } else {
                self.hub.deliver(self.peer_side(), call_id, frame.clone());
            }
        }
        Ok(())
    }

    fn subscribe(&self, call_id: &CallId) -> Result<Subscription, SignalingError> {
        self.hub.ensure_available()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let token = self.hub.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut mailboxes = self.hub.mailboxes[self.side].lock();
            let pending = match mailboxes.remove(call_id) {
                Some(Mailbox::Subscribed { token: live, sender: existing })
                    if !existing.is_closed() =>
                {
                    mailboxes.insert(
                        call_id.clone(),
                        Mailbox::Subscribed {
                            token: live,
                            sender: existing,
                        },
                    );
                    return Err(SignalingError::AlreadySubscribed(call_id.clone()));
                }
                Some(Mailbox::Pending(frames)) => frames,
                _ => Vec::new(),
            };

            for frame in pending {
                match SignalingPayload::from_json(&frame) {
                    Ok(payload) => {
                        let _ = sender.send(payload);
                    }
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, error = %e, "Dropping undecodable relay frame");
                    }
                }
            }
            mailboxes.insert(call_id.clone(), Mailbox::Subscribed { token, sender });
        }

        let hub = Arc::clone(&self.hub);
        let side = self.side;
        let key = call_id.clone();
        Ok(Subscription::new(call_id.clone(), receiver, move || {
            let mut mailboxes = hub.mailboxes[side].lock();
            if matches!(mailboxes.get(&key), Some(Mailbox::Subscribed { token: t, .. }) if *t == token)
            {
                mailboxes.remove(&key);
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::IceCandidate;

    fn offer(sdp: &str) -> SignalingPayload {
        SignalingPayload::Offer {
            sdp: sdp.to_string(),
        }
    }

    #[tokio::test]
    async fn test_relay_delivers_to_other_party() {
        let (a, b) = InMemoryRelay::pair();
        let call = CallId::new("call-1");
        let mut sub_b = b.subscribe(&call).unwrap();
        let mut sub_a = a.subscribe(&call).unwrap();

        a.send(&call, offer("a")).await.unwrap();
        assert_eq!(sub_b.recv().await, Some(offer("a")));

        b.send(&call, offer("b")).await.unwrap();
        assert_eq!(sub_a.recv().await, Some(offer("b")));
    }

    #[tokio::test]
    async fn test_relay_buffers_until_subscribed() {
        let (a, b) = InMemoryRelay::pair();
        let call = CallId::new("late");

        a.send(&call, offer("1")).await.unwrap();
        a.send(
            &call,
            SignalingPayload::IceCandidate {
                candidate: IceCandidate::new("candidate:1"),
            },
        )
        .await
        .unwrap();

        let mut sub = b.subscribe(&call).unwrap();
        assert_eq!(sub.recv().await, Some(offer("1")));
        assert!(matches!(
            sub.recv().await,
            Some(SignalingPayload::IceCandidate { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_routes_by_call_id() {
        let (a, b) = InMemoryRelay::pair();
        let mut sub_one = b.subscribe(&CallId::new("one")).unwrap();
        let mut sub_two = b.subscribe(&CallId::new("two")).unwrap();

        a.send(&CallId::new("two"), offer("for-two")).await.unwrap();
        a.send(&CallId::new("one"), offer("for-one")).await.unwrap();

        assert_eq!(sub_one.recv().await, Some(offer("for-one")));
        assert_eq!(sub_two.recv().await, Some(offer("for-two")));
    }

    #[tokio::test]
    async fn test_relay_outage() {
        let (a, b) = InMemoryRelay::pair();
        a.set_available(false);

        let call = CallId::new("down");
        assert!(matches!(
            a.send(&call, offer("x")).await,
            Err(SignalingError::RelayUnavailable(_))
        ));
        assert!(matches!(
            b.subscribe(&call),
            Err(SignalingError::RelayUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_duplicate_delivery() {
        let (a, b) = InMemoryRelay::pair();
        let call = CallId::new("dup");
        let mut sub = b.subscribe(&call).unwrap();
        a.set_duplicate_delivery(true);

        a.send(&call, offer("x")).await.unwrap();
        assert_eq!(sub.recv().await, Some(offer("x")));
        assert_eq!(sub.recv().await, Some(offer("x")));
        assert_eq!(b.frames_delivered(), 2);
    }

    #[tokio::test]
    async fn test_relay_held_frames_released_reversed() {
        let (a, b) = InMemoryRelay::pair();
        let call = CallId::new("held");
        let mut sub = b.subscribe(&call).unwrap();

        a.set_hold_deliveries(true);
        a.send(&call, offer("first")).await.unwrap();
        a.send(&call, offer("second")).await.unwrap();
        assert_eq!(a.held_count(), 2);

        a.set_hold_deliveries(false);
        a.release_held_reversed();
        assert_eq!(sub.recv().await, Some(offer("second")));
        assert_eq!(sub.recv().await, Some(offer("first")));
    }

    #[tokio::test]
    async fn test_second_subscription_rejected_until_dropped() {
        let (_a, b) = InMemoryRelay::pair();
        let call = CallId::new("c");
        let sub = b.subscribe(&call).unwrap();

        assert!(matches!(
            b.subscribe(&call),
            Err(SignalingError::AlreadySubscribed(_))
        ));

        sub.unsubscribe();
        assert!(b.subscribe(&call).is_ok());
    }

    #[tokio::test]
    async fn test_handler_counts_sends() {
        let (a, b) = InMemoryRelay::pair();
        let handler = SignalingHandler::new(Arc::new(a.clone()));
        let call = CallId::new("counted");
        let _sub = b.subscribe(&call).unwrap();

        handler.send_payload(&call, offer("x")).await.unwrap();
        a.set_available(false);
        assert!(handler.send_payload(&call, offer("y")).await.is_err());

        assert_eq!(handler.sent_count(), 1);
        assert_eq!(handler.send_failure_count(), 1);
    }
}
