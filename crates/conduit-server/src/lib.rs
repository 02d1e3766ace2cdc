//! # conduit-server
//!
//! Axum HTTP + `WebSocket` gateway in front of the turn scheduler.
//!
//! - `GET /ws`: viewer connections (`chat`, `subscribe`, `stop`, `ping`)
//!   with ping frames and an inactivity monitor
//! - `GET /health`, `GET /workers` (pool status plus streaming flags),
//!   `GET /metrics` (Prometheus text)
//! - Lifecycle events fanned out to every viewer by the event bridge
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use server::{AppState, ConduitServer};
pub use shutdown::ShutdownCoordinator;
