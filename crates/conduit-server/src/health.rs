//! `/health` and `/workers` response bodies.

use std::time::Instant;

use serde::Serialize;

use conduit_core::SessionId;
use conduit_runtime::ActiveStreamRegistry;
use conduit_worker::{WorkerInfo, WorkerPool};

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current viewer connection count.
    pub connections: usize,
    /// Sessions with a turn in flight.
    pub streaming_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, streaming: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        streaming_sessions: streaming,
    }
}

/// One pooled worker and whether its session is streaming.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// Session the worker serves.
    pub session_id: SessionId,
    /// Process snapshot.
    #[serde(flatten)]
    pub info: WorkerInfo,
    /// Whether the session has a turn in flight.
    pub streaming: bool,
}

/// `/workers` response body.
#[derive(Debug, Clone, Serialize)]
pub struct WorkersResponse {
    /// Whether persistent workers are in use. When false every turn is one-shot.
    pub pool_enabled: bool,
    /// Pooled workers ordered by session.
    pub workers: Vec<WorkerStatus>,
    /// Every session with a turn in flight, pooled or not.
    pub streaming_sessions: Vec<SessionId>,
}

/// Snapshot the pool and the streaming flags.
pub fn workers_report(pool: Option<&WorkerPool>, streams: &ActiveStreamRegistry) -> WorkersResponse {
    let streaming_sessions = streams.streaming_sessions();
    let workers = pool
        .map(WorkerPool::status)
        .unwrap_or_default()
        .into_iter()
        .map(|(session_id, info)| WorkerStatus {
            session_id,
            info,
            streaming: streaming_sessions.contains(&session_id),
        })
        .collect();
    WorkersResponse {
        pool_enabled: pool.is_some(),
        workers,
        streaming_sessions,
    }
}
