//! # conduit-runtime
//!
//! Session-level orchestration above the worker layer:
//!
//! - **Scheduler**: `TurnScheduler` runs one turn per session and queues the rest
//! - **Active streams**: replaceable per-turn sinks so viewers can detach and reattach
//! - **Emitter**: broadcast channel for lifecycle events
//! - **Usage**: ledger for externally metered token counts
//! - **Store**: `SessionStore` seam plus the in-memory `MemoryStore`

#![deny(unsafe_code)]

pub mod active_stream;
pub mod emitter;
pub mod errors;
pub mod scheduler;
pub mod store;
pub mod usage;

#[cfg(test)]
mod testing;

pub use active_stream::{ActiveStream, ActiveStreamRegistry, AttachedSink, EventSink, NoopSink};
pub use emitter::EventEmitter;
pub use errors::RuntimeError;
pub use scheduler::{SubmitOutcome, SubmitRequest, TurnScheduler};
pub use store::{MemoryStore, MessageRecord, SessionRecord, SessionStore, StoreError, UsageRecord};
pub use usage::UsageLedger;
