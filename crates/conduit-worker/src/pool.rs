//! Keyed registry of persistent workers.
//!
//! At most one non-dead [`Worker`] exists per session. Creation happens under
//! the map's write lock, so two concurrent `get_or_create` calls for the same
//! session observe the same worker. Spawning is synchronous (the process is
//! started and its reader task scheduled), which keeps the critical section
//! free of awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use conduit_core::SessionId;

use crate::command::{LaunchConfig, TurnParams};
use crate::errors::WorkerError;
use crate::worker::{Worker, WorkerInfo};

/// Pool timing.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Idle time after which a worker is reaped.
    pub idle_timeout: Duration,
    /// Time between reaper sweeps.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl PoolConfig {
    /// Timing from loaded settings.
    pub fn from_settings(pool: &conduit_settings::PoolSettings) -> Self {
        Self {
            idle_timeout: Duration::from_secs(pool.idle_timeout_secs),
            reap_interval: Duration::from_secs(pool.reap_interval_secs),
        }
    }
}

/// Registry of persistent workers keyed by session.
pub struct WorkerPool {
    workers: RwLock<HashMap<SessionId, Arc<Worker>>>,
    launch: LaunchConfig,
    config: PoolConfig,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new(launch: LaunchConfig, config: PoolConfig) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            launch,
            config,
        }
    }

    /// Launch settings used for new workers.
    pub fn launch_config(&self) -> &LaunchConfig {
        &self.launch
    }

    /// Return the live worker for the session, spawning one if needed.
    ///
    /// A dead entry is removed and the replacement resumes the conversation
    /// regardless of `params.resume`.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub fn get_or_create(&self, params: &TurnParams) -> Result<Arc<Worker>, WorkerError> {
        let mut workers = self.workers.write();

        let mut params = params.clone();
        if let Some(existing) = workers.get(&params.session_id) {
            if !existing.is_dead() {
                return Ok(Arc::clone(existing));
            }
            debug!("replacing dead worker, switching to resume");
            existing.kill();
            let _ = workers.remove(&params.session_id);
            params.resume = true;
        }

        let worker = Worker::spawn(&self.launch, &params)?;
        let _ = workers.insert(params.session_id, Arc::clone(&worker));
        metrics::counter!(conduit_core::metric_names::WORKERS_SPAWNED_TOTAL).increment(1);
        Ok(worker)
    }

    /// Kill and remove the session's worker. No-op when absent.
    pub fn kill(&self, session_id: SessionId) -> bool {
        let removed = self.workers.write().remove(&session_id);
        match removed {
            Some(worker) => {
                worker.kill();
                debug!(%session_id, "worker removed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of every worker.
    pub fn status(&self) -> BTreeMap<SessionId, WorkerInfo> {
        self.workers
            .read()
            .iter()
            .map(|(id, worker)| (*id, worker.info()))
            .collect()
    }

    /// Whether the session has a live worker.
    pub fn is_alive(&self, session_id: SessionId) -> bool {
        self.workers
            .read()
            .get(&session_id)
            .is_some_and(|w| !w.is_dead())
    }

    /// Number of registered workers (including dead ones not yet reaped).
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Remove dead workers and idle workers older than the configured timeout.
    pub fn reap_idle(&self) -> usize {
        self.reap_older_than(self.config.idle_timeout)
    }

    /// Remove dead workers and idle workers idle for longer than `idle_timeout`.
    ///
    /// Busy workers are never reaped.
    pub fn reap_older_than(&self, idle_timeout: Duration) -> usize {
        let mut workers = self.workers.write();
        let before = workers.len();
        workers.retain(|session_id, worker| {
            let reap = worker.is_dead()
                || (worker.state() == crate::worker::WorkerState::Idle
                    && worker.idle_for() >= idle_timeout);
            if reap {
                worker.kill();
                debug!(%session_id, "reaping worker");
            }
            !reap
        });
        let reaped = before - workers.len();
        if reaped > 0 {
            info!(reaped, remaining = workers.len(), "reaped agent workers");
            metrics::counter!(conduit_core::metric_names::WORKERS_REAPED_TOTAL)
                .increment(reaped as u64);
        }
        reaped
    }

    /// Run the periodic reaper until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = pool.reap_idle();
                    }
                }
            }
            debug!("worker reaper stopped");
        })
    }

    /// Kill every worker.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.workers.write().drain().collect();
        let count = drained.len();
        for (_, worker) in drained {
            worker.kill();
        }
        info!(count, "worker pool shut down");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{FakeAgent, collect_lines};
    use crate::worker::WorkerState;
    use conduit_core::AgentSessionId;

    fn params(id: i64) -> TurnParams {
        TurnParams::new(SessionId::new(id), AgentSessionId::generate(), false)
    }

    fn pool(agent: &FakeAgent) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(agent.config(), PoolConfig::default()))
    }

    #[tokio::test]
    async fn reuses_live_worker() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let a = pool.get_or_create(&params(1)).unwrap();
        let b = pool.get_or_create(&params(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn separate_sessions_get_separate_workers() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let a = pool.get_or_create(&params(1)).unwrap();
        let b = pool.get_or_create(&params(2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.status().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_worker() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.get_or_create(&params(9)).unwrap() }));
        }
        let mut workers = Vec::new();
        for handle in handles {
            workers.push(handle.await.unwrap());
        }
        assert!(workers.iter().all(|w| Arc::ptr_eq(w, &workers[0])));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn dead_worker_replaced() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let first = pool.get_or_create(&params(1)).unwrap();
        first.kill();
        let second = pool.get_or_create(&params(1)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_dead());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_tolerates_absent() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        assert!(!pool.kill(SessionId::new(42)));
        let worker = pool.get_or_create(&params(1)).unwrap();
        assert!(pool.kill(SessionId::new(1)));
        assert!(!pool.kill(SessionId::new(1)));
        assert!(worker.is_dead());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn status_reports_idle_workers() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let worker = pool.get_or_create(&params(3)).unwrap();
        let (result, _) = collect_lines(&worker, "hi").await;
        result.unwrap();
        let status = pool.status();
        let info = &status[&SessionId::new(3)];
        assert_eq!(info.state, WorkerState::Idle);
        assert_eq!(info.pid, worker.pid());
        assert!(pool.is_alive(SessionId::new(3)));
    }

    #[tokio::test]
    async fn reap_removes_idle_and_dead() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let idle = pool.get_or_create(&params(1)).unwrap();
        let dead = pool.get_or_create(&params(2)).unwrap();
        dead.kill();

        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.len(), 1);
        assert!(!idle.is_dead());

        assert_eq!(pool.reap_older_than(Duration::ZERO), 1);
        assert!(idle.is_dead());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn reap_skips_busy_workers() {
        let agent = FakeAgent::hang();
        let pool = pool(&agent);
        let worker = pool.get_or_create(&params(1)).unwrap();
        let running = Arc::clone(&worker);
        let cancel = CancellationToken::new();
        let turn_cancel = cancel.clone();
        let turn = tokio::spawn(async move {
            let mut sink = |_: &str| {};
            running.send("x", &turn_cancel, &mut sink).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.reap_older_than(Duration::ZERO), 0);
        cancel.cancel();
        let _ = turn.await.unwrap();
    }

    #[tokio::test]
    async fn reaper_task_stops_on_cancel() {
        let agent = FakeAgent::echo();
        let pool = Arc::new(WorkerPool::new(
            agent.config(),
            PoolConfig {
                idle_timeout: Duration::ZERO,
                reap_interval: Duration::from_millis(20),
            },
        ));
        let worker = pool.get_or_create(&params(1)).unwrap();
        let cancel = CancellationToken::new();
        let handle = pool.spawn_reaper(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(worker.is_dead());
        assert!(pool.is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_kills_all() {
        let agent = FakeAgent::echo();
        let pool = pool(&agent);
        let a = pool.get_or_create(&params(1)).unwrap();
        let b = pool.get_or_create(&params(2)).unwrap();
        pool.shutdown();
        assert!(a.is_dead() && b.is_dead());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_entry() {
        let pool = WorkerPool::new(LaunchConfig::new("/nonexistent/agent"), PoolConfig::default());
        assert!(matches!(
            pool.get_or_create(&params(1)),
            Err(WorkerError::Spawn(_))
        ));
        assert!(pool.is_empty());
    }
}
