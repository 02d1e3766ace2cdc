//! # conduit-protocol
//!
//! Decoding of the agent CLI's line-oriented stream-json output and the
//! per-turn demultiplexer that turns it into viewer events.
//!
//! - [`types`]: typed line structures (`error`, `stream_event`, `result`,
//!   `assistant`), the per-turn user input line, terminal detection
//! - [`demux`]: [`TurnDemux`], which routes deltas and accumulates text,
//!   reasoning summary, tool steps, usage and title

#![deny(unsafe_code)]

pub mod demux;
pub mod types;

pub use demux::{DemuxLimits, TurnDemux, truncate_chars};
pub use types::{AgentLine, ResultHeader, Terminal, UserInput, terminal_of};
