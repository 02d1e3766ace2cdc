//! Viewer connections: state, liveness, dispatch, and broadcasting.

pub mod broadcast;
pub mod connection;
pub mod event_bridge;
pub mod handler;
pub mod heartbeat;
pub mod session;
