//! Broadcast channel for session lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use conduit_core::HubEvent;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of lifecycle events to every listener (normally the server's
/// event bridge).
///
/// `emit` never awaits. Slow receivers lag instead of blocking the turn.
pub struct EventEmitter {
    tx: broadcast::Sender<HubEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Emitter with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Emitter with a custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit to all receivers. Returns how many received it.
    pub fn emit(&self, event: HubEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Number of receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{EventKind, SessionId, StreamingStatus};

    #[test]
    fn emit_without_receivers() {
        let emitter = EventEmitter::new();
        assert_eq!(
            emitter.emit(HubEvent::status(SessionId::new(1), StreamingStatus::Idle)),
            0
        );
        assert_eq!(emitter.emit_count(), 1);
    }

    #[tokio::test]
    async fn receivers_get_events_in_order() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 1);

        let _ = emitter.emit(HubEvent::status(SessionId::new(1), StreamingStatus::Streaming));
        let _ = emitter.emit(HubEvent::now(
            SessionId::new(1),
            EventKind::MessageQueued {
                content: "later".into(),
            },
        ));

        assert_eq!(rx.recv().await.unwrap().kind.name(), "streaming_status");
        assert_eq!(rx.recv().await.unwrap().kind.name(), "message_queued");
    }

    #[tokio::test]
    async fn slow_receiver_lags() {
        let emitter = EventEmitter::with_capacity(2);
        let mut rx = emitter.subscribe();
        for _ in 0..5 {
            let _ = emitter.emit(HubEvent::status(SessionId::new(1), StreamingStatus::Idle));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
