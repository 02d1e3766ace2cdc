//! # conduit-core
//!
//! Shared vocabulary for the Conduit crates:
//!
//! - **Ids**: `SessionId`, `MessageId` (storage integers) and `AgentSessionId`
//!   (the agent CLI's conversation token)
//! - **Events**: outbound `HubEvent` / `EventKind` and inbound `ClientMessage`
//! - **Usage**: `TokenUsage` counters with additive accumulation
//! - **Messages**: `Role`, `StepRecord`, `TurnMetadata`
//! - **Logging**: `tracing` subscriber initialization
//! - **Metric names**: constants shared by every crate that records metrics

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod metric_names;
pub mod usage;

pub use events::{ClientMessage, Delivery, EventKind, HubEvent, StreamingStatus};
pub use ids::{AgentSessionId, MessageId, SessionId};
pub use messages::{Role, StepRecord, TurnMetadata};
pub use usage::TokenUsage;
