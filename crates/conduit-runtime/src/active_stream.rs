//! In-flight turns and their replaceable consumers.
//!
//! An [`ActiveStream`] decouples a turn's producer from whichever viewer is
//! currently watching it. The producer calls [`ActiveStream::send`] without
//! knowing whether anyone is attached; viewers come and go through
//! [`ActiveStream::swap_sink`] and [`ActiveStream::detach`].
//!
//! Delivery happens under the stream's lock. A swap takes the lock
//! exclusively, delivers its acknowledgement to the new sink, then installs
//! it, so the new viewer sees the acknowledgement strictly before any event
//! produced after the swap.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use conduit_core::{HubEvent, SessionId, StreamingStatus};

/// Consumer of a turn's events.
///
/// Delivery must not block: implementations queue or drop.
pub trait EventSink: Send + Sync {
    /// Accept one event.
    fn deliver(&self, event: &HubEvent);
}

/// Sink that discards everything.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn deliver(&self, _event: &HubEvent) {}
}

/// A sink plus the id of the viewer owning it.
#[derive(Clone)]
pub struct AttachedSink {
    /// Viewer connection id.
    pub id: String,
    /// Delivery target.
    pub sink: Arc<dyn EventSink>,
}

struct Slot {
    owner: Option<String>,
    sink: Arc<dyn EventSink>,
}

impl Slot {
    fn detached() -> Self {
        Self {
            owner: None,
            sink: Arc::new(NoopSink),
        }
    }
}

/// One in-flight turn.
pub struct ActiveStream {
    session_id: SessionId,
    slot: RwLock<Slot>,
    cancel: CancellationToken,
    closed: AtomicBool,
    started_at: Instant,
}

impl ActiveStream {
    /// A stream with nobody attached.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            slot: RwLock::new(Slot::detached()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Session this stream belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Time since the stream was registered.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Deliver to the current sink.
    pub fn send(&self, event: &HubEvent) {
        self.slot.read().sink.deliver(event);
    }

    /// Replace the sink. `ack` reaches the new sink before any later event.
    pub fn swap_sink(&self, id: &str, sink: Arc<dyn EventSink>, ack: Option<&HubEvent>) {
        let mut slot = self.slot.write();
        if let Some(ack) = ack {
            sink.deliver(ack);
        }
        let previous = slot.owner.replace(id.to_string());
        slot.sink = sink;
        debug!(session_id = %self.session_id, viewer = id, ?previous, "stream sink swapped");
    }

    /// Revert to the no-op sink if `id` is attached. Returns whether it was.
    pub fn detach(&self, id: &str) -> bool {
        let mut slot = self.slot.write();
        if slot.owner.as_deref() != Some(id) {
            return false;
        }
        *slot = Slot::detached();
        debug!(session_id = %self.session_id, viewer = id, "stream sink detached");
        true
    }

    /// The attached viewer, if any.
    pub fn attached(&self) -> Option<AttachedSink> {
        let slot = self.slot.read();
        slot.owner.as_ref().map(|id| AttachedSink {
            id: id.clone(),
            sink: Arc::clone(&slot.sink),
        })
    }

    /// Request cancellation of the turn.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the turn and retire the session: queued messages are not
    /// replayed after it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token observed by the turn's producer.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// All in-flight turns, at most one per session.
#[derive(Default)]
pub struct ActiveStreamRegistry {
    streams: RwLock<HashMap<SessionId, Arc<ActiveStream>>>,
}

impl ActiveStreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh stream. `None` when the session already has one.
    pub fn try_register(&self, session_id: SessionId) -> Option<Arc<ActiveStream>> {
        let mut streams = self.streams.write();
        if streams.contains_key(&session_id) {
            return None;
        }
        let stream = Arc::new(ActiveStream::new(session_id));
        let _ = streams.insert(session_id, Arc::clone(&stream));
        Some(stream)
    }

    /// The session's stream.
    pub fn get(&self, session_id: SessionId) -> Option<Arc<ActiveStream>> {
        self.streams.read().get(&session_id).cloned()
    }

    /// Remove `stream`, but only if it is still the registered entry.
    pub fn remove(&self, stream: &Arc<ActiveStream>) -> bool {
        let mut streams = self.streams.write();
        match streams.get(&stream.session_id) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                let _ = streams.remove(&stream.session_id);
                true
            }
            _ => false,
        }
    }

    /// Attach a viewer to the session's stream.
    ///
    /// The viewer receives `streaming_status{streaming}` before any later
    /// event, or `streaming_status{idle}` when nothing is in flight.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        id: &str,
        sink: Arc<dyn EventSink>,
    ) -> StreamingStatus {
        // Held across the swap so the stream cannot be deregistered mid-attach.
        let streams = self.streams.read();
        match streams.get(&session_id) {
            Some(stream) => {
                let ack = HubEvent::status(session_id, StreamingStatus::Streaming);
                stream.swap_sink(id, sink, Some(&ack));
                StreamingStatus::Streaming
            }
            None => {
                sink.deliver(&HubEvent::status(session_id, StreamingStatus::Idle));
                StreamingStatus::Idle
            }
        }
    }

    /// Cancel the session's turn. Returns whether one was running.
    pub fn cancel(&self, session_id: SessionId) -> bool {
        match self.get(session_id) {
            Some(stream) => {
                stream.cancel();
                true
            }
            None => false,
        }
    }

    /// Close the session's stream. Returns whether one was running.
    pub fn close(&self, session_id: SessionId) -> bool {
        match self.get(session_id) {
            Some(stream) => {
                stream.close();
                true
            }
            None => false,
        }
    }

    /// Close every stream.
    pub fn close_all(&self) {
        for stream in self.streams.read().values() {
            stream.close();
        }
    }

    /// Detach viewer `id` from every stream it is attached to.
    pub fn detach_all(&self, id: &str) -> usize {
        self.streams
            .read()
            .values()
            .filter(|stream| stream.detach(id))
            .count()
    }

    /// Sessions with a turn in flight.
    pub fn streaming_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<_> = self.streams.read().keys().copied().collect();
        sessions.sort_unstable();
        sessions
    }

    /// Whether the session has a turn in flight.
    pub fn is_streaming(&self, session_id: SessionId) -> bool {
        self.streams.read().contains_key(&session_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use conduit_core::EventKind;

    fn chunk(session: i64, text: &str) -> HubEvent {
        HubEvent::now(
            SessionId::new(session),
            EventKind::Chunk {
                content: text.into(),
            },
        )
    }

    #[test]
    fn send_without_sink_is_noop() {
        let stream = ActiveStream::new(SessionId::new(1));
        stream.send(&chunk(1, "lost"));
        assert!(stream.attached().is_none());
    }

    #[test]
    fn swap_delivers_ack_then_later_events() {
        let stream = ActiveStream::new(SessionId::new(1));
        let first = RecordingSink::new();
        let second = RecordingSink::new();

        stream.swap_sink("v1", first.clone(), None);
        stream.send(&chunk(1, "a"));
        stream.swap_sink(
            "v2",
            second.clone(),
            Some(&HubEvent::status(SessionId::new(1), StreamingStatus::Streaming)),
        );
        stream.send(&chunk(1, "b"));

        assert_eq!(first.names(), vec!["chunk"]);
        assert_eq!(second.names(), vec!["streaming_status", "chunk"]);
        assert_eq!(second.chunks(), "b");
        assert_eq!(stream.attached().unwrap().id, "v2");
    }

    #[test]
    fn detach_only_for_owner() {
        let stream = ActiveStream::new(SessionId::new(1));
        let sink = RecordingSink::new();
        stream.swap_sink("v1", sink.clone(), None);

        assert!(!stream.detach("v2"));
        stream.send(&chunk(1, "kept"));
        assert!(stream.detach("v1"));
        stream.send(&chunk(1, "dropped"));
        assert_eq!(sink.chunks(), "kept");
        assert!(!stream.detach("v1"));
    }

    #[test]
    fn register_is_exclusive_per_session() {
        let registry = ActiveStreamRegistry::new();
        let stream = registry.try_register(SessionId::new(1)).unwrap();
        assert!(registry.try_register(SessionId::new(1)).is_none());
        assert!(registry.try_register(SessionId::new(2)).is_some());
        assert_eq!(
            registry.streaming_sessions(),
            vec![SessionId::new(1), SessionId::new(2)]
        );
        assert!(Arc::ptr_eq(&registry.get(SessionId::new(1)).unwrap(), &stream));
    }

    #[test]
    fn remove_ignores_superseded_entry() {
        let registry = ActiveStreamRegistry::new();
        let old = registry.try_register(SessionId::new(1)).unwrap();
        assert!(registry.remove(&old));
        let new = registry.try_register(SessionId::new(1)).unwrap();
        assert!(!registry.remove(&old));
        assert!(registry.is_streaming(SessionId::new(1)));
        assert!(registry.remove(&new));
        assert!(!registry.is_streaming(SessionId::new(1)));
    }

    #[test]
    fn subscribe_idle_and_streaming() {
        let registry = ActiveStreamRegistry::new();
        let sink = RecordingSink::new();
        assert_eq!(
            registry.subscribe(SessionId::new(4), "v", sink.clone()),
            StreamingStatus::Idle
        );
        assert_eq!(sink.statuses(), vec![StreamingStatus::Idle]);

        let stream = registry.try_register(SessionId::new(4)).unwrap();
        assert_eq!(
            registry.subscribe(SessionId::new(4), "v", sink.clone()),
            StreamingStatus::Streaming
        );
        stream.send(&chunk(4, "x"));
        assert_eq!(
            sink.statuses(),
            vec![StreamingStatus::Idle, StreamingStatus::Streaming]
        );
        assert_eq!(sink.chunks(), "x");
    }

    #[test]
    fn reattachment_sees_only_later_chunks() {
        let registry = ActiveStreamRegistry::new();
        let stream = registry.try_register(SessionId::new(1)).unwrap();
        let viewer1 = RecordingSink::new();
        let viewer2 = RecordingSink::new();

        let _ = registry.subscribe(SessionId::new(1), "v1", viewer1.clone());
        stream.send(&chunk(1, "Hel"));
        let _ = registry.detach_all("v1");
        let _ = registry.subscribe(SessionId::new(1), "v2", viewer2.clone());
        stream.send(&chunk(1, "lo"));

        assert_eq!(viewer1.chunks(), "Hel");
        assert_eq!(viewer2.names(), vec!["streaming_status", "chunk"]);
        assert_eq!(viewer2.chunks(), "lo");
    }

    #[test]
    fn cancel_and_detach_all() {
        let registry = ActiveStreamRegistry::new();
        let a = registry.try_register(SessionId::new(1)).unwrap();
        let b = registry.try_register(SessionId::new(2)).unwrap();
        let sink = RecordingSink::new();
        a.swap_sink("v", sink.clone(), None);
        b.swap_sink("v", sink, None);

        assert_eq!(registry.detach_all("v"), 2);
        assert!(registry.cancel(SessionId::new(1)));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!registry.cancel(SessionId::new(3)));
        assert!(!a.is_closed());

        registry.close_all();
        assert!(b.cancel_token().is_cancelled());
        assert!(a.is_closed() && b.is_closed());
    }

    #[test]
    fn close_cancels_and_marks_closed() {
        let registry = ActiveStreamRegistry::new();
        let stream = registry.try_register(SessionId::new(4)).unwrap();
        assert!(registry.close(SessionId::new(4)));
        assert!(stream.is_cancelled());
        assert!(stream.is_closed());
        assert!(!registry.close(SessionId::new(5)));
    }

    #[test]
    fn order_preserved_across_concurrent_swaps() {
        let stream = Arc::new(ActiveStream::new(SessionId::new(1)));
        let sinks: Vec<_> = (0..4).map(|_| RecordingSink::new()).collect();

        let producer = {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    stream.send(&chunk(1, &format!("{i},")));
                }
            })
        };
        for (n, sink) in sinks.iter().enumerate() {
            stream.swap_sink(&format!("v{n}"), sink.clone(), None);
            std::thread::yield_now();
        }
        producer.join().unwrap();

        for sink in &sinks {
            let seen: Vec<u32> = sink
                .chunks()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().unwrap())
                .collect();
            assert!(seen.windows(2).all(|w| w[0] + 1 == w[1]), "gap or reorder");
        }
    }
}
