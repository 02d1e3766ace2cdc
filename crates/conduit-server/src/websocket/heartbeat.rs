//! Viewer liveness monitoring.
//!
//! Ping frames go out from the connection's writer task; this monitor only
//! watches inbound activity. Any frame (pong, text, ping) counts.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound frame within the timeout.
    TimedOut,
    /// The connection ended first.
    Cancelled,
}

/// Watch `connection` until it has been silent for `timeout` or `cancel` fires.
///
/// Checks once per `interval`, so a dead viewer is noticed between
/// `timeout` and `timeout + interval` after its last frame.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check = time::interval(interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = check.tick() => {
                let idle = connection.idle_for();
                if idle >= timeout {
                    warn!(conn_id = %connection.id, idle_secs = idle.as_secs(), "viewer unresponsive");
                    return HeartbeatResult::TimedOut;
                }
            }
        }
    }
}
