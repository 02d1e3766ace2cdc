//! Viewer connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use conduit_core::metric_names::WS_SEND_DROPS_TOTAL;
use conduit_core::{HubEvent, SessionId};
use conduit_runtime::EventSink;

/// A connected viewer.
///
/// Also the [`EventSink`] installed on a session's active stream while this
/// viewer watches it. Delivery never blocks: a full outbound queue drops the
/// message and counts it.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: String,
    /// Session this viewer last subscribed to or chatted in.
    session_id: Mutex<Option<SessionId>>,
    /// Queue drained by the connection's writer task.
    tx: mpsc::Sender<Arc<String>>,
    /// When the connection was established.
    connected_at: Instant,
    /// Last inbound frame of any kind.
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a connection writing into `tx`.
    pub fn new(id: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session_id: Mutex::new(None),
            tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Bind to a session, returning the previous binding.
    pub fn bind_session(&self, session_id: SessionId) -> Option<SessionId> {
        self.session_id.lock().replace(session_id)
    }

    /// Currently bound session.
    pub fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock()
    }

    /// Queue a text frame. Returns `false` if it was dropped.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            return true;
        }
        let dropped = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!(WS_SEND_DROPS_TOTAL).increment(1);
        if dropped.is_power_of_two() {
            warn!(conn_id = %self.id, dropped, "viewer queue full or closed, dropping");
        }
        false
    }

    /// Serialize and queue a JSON value.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Serialize and queue an outbound event.
    pub fn send_event(&self, event: &HubEvent) -> bool {
        match event.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(error) => {
                warn!(conn_id = %self.id, event = event.kind.name(), %error, "failed to serialize event");
                false
            }
        }
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or connection establishment).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Messages dropped so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl EventSink for ClientConnection {
    fn deliver(&self, event: &HubEvent) {
        let _ = self.send_event(event);
    }
}
