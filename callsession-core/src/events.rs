//! Per-session event delivery
//!
//! Each session owns its observer list. Delivery enforces the lifecycle
//! guarantees observers rely on: `Connected` and `Ended` are delivered at
//! most once, and nothing is delivered after the session reaches a terminal
//! state.

use crate::types::{CallEvent, CallId, CallState, ErrorKind, RemoteTrackInfo};
use tokio::sync::mpsc;

/// Receiving side handed to observers
pub type EventReceiver = mpsc::UnboundedReceiver<CallEvent>;

pub(crate) type EventSender = mpsc::UnboundedSender<CallEvent>;

#[derive(Debug)]
pub(crate) struct SessionEvents {
    call_id: CallId,
    observers: Vec<EventSender>,
    connected_sent: bool,
    finished: bool,
}

impl SessionEvents {
    pub(crate) fn new(call_id: CallId, observers: Vec<EventSender>) -> Self {
        Self {
            call_id,
            observers,
            connected_sent: false,
            finished: false,
        }
    }

    pub(crate) fn add_observer(&mut self, observer: EventSender) {
        if self.finished {
            return;
        }
        self.observers.push(observer);
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn deliver(&mut self, event: CallEvent) {
        tracing::trace!(call_id = %self.call_id, event = ?event, "Delivering call event");
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }

    pub(crate) fn state_changed(&mut self, from: CallState, to: CallState) {
        if self.finished {
            return;
        }
        self.deliver(CallEvent::StateChanged {
            call_id: self.call_id.clone(),
            from,
            to,
        });
    }

    pub(crate) fn connected(&mut self) {
        if self.finished || self.connected_sent {
            return;
        }
        self.connected_sent = true;
        self.deliver(CallEvent::Connected {
            call_id: self.call_id.clone(),
        });
    }

    pub(crate) fn remote_stream(&mut self, tracks: Vec<RemoteTrackInfo>) {
        if self.finished {
            return;
        }
        self.deliver(CallEvent::RemoteStream {
            call_id: self.call_id.clone(),
            tracks,
        });
    }

    pub(crate) fn error(&mut self, kind: ErrorKind) {
        if self.finished {
            return;
        }
        self.deliver(CallEvent::Error {
            call_id: self.call_id.clone(),
            kind,
        });
    }

    /// Deliver the terminal transition and detach every observer
    ///
    /// `error` is delivered before the transition. `Ended` follows a
    /// transition into [`CallState::Ended`].
    pub(crate) fn finish(&mut self, from: CallState, to: CallState, error: Option<ErrorKind>) {
        if self.finished {
            return;
        }
        if let Some(kind) = error {
            self.error(kind);
        }
        self.state_changed(from, to);
        if to == CallState::Ended {
            self.deliver(CallEvent::Ended {
                call_id: self.call_id.clone(),
            });
        }
        self.finished = true;
        self.observers.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(rx: &mut EventReceiver) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_connected_delivered_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut events = SessionEvents::new(CallId::new("c"), vec![tx]);
        events.connected();
        events.connected();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_nothing_after_finish() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = CallId::new("c");
        let mut events = SessionEvents::new(id.clone(), vec![tx]);
        events.finish(CallState::Connected, CallState::Ended, None);
        events.finish(CallState::Connected, CallState::Ended, None);
        events.connected();
        events.error(ErrorKind::NegotiationFailed);

        assert_eq!(
            drain(&mut rx),
            vec![
                CallEvent::StateChanged {
                    call_id: id.clone(),
                    from: CallState::Connected,
                    to: CallState::Ended,
                },
                CallEvent::Ended { call_id: id },
            ]
        );
        // observers are dropped, so the channel is closed
        assert!(rx.try_recv().is_err());
        assert_eq!(events.observer_count(), 0);
    }

    #[test]
    fn test_failure_reports_error_without_ended() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = CallId::new("c");
        let mut events = SessionEvents::new(id.clone(), vec![tx]);
        events.finish(
            CallState::Negotiating,
            CallState::Failed,
            Some(ErrorKind::RelayUnavailable),
        );

        assert_eq!(
            drain(&mut rx),
            vec![
                CallEvent::Error {
                    call_id: id.clone(),
                    kind: ErrorKind::RelayUnavailable,
                },
                CallEvent::StateChanged {
                    call_id: id,
                    from: CallState::Negotiating,
                    to: CallState::Failed,
                },
            ]
        );
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut events = SessionEvents::new(CallId::new("c"), vec![tx1, tx2]);
        drop(rx1);
        events.connected();
        assert_eq!(events.observer_count(), 1);
        assert_eq!(drain(&mut rx2).len(), 1);
    }
}
