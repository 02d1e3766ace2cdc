//! A persistent agent process bound to one session.
//!
//! The child process is owned by a reader task that forwards stdout lines
//! into a bounded channel, waits for exit, then marks the worker dead and
//! closes the channel. A turn (`send`) writes one input line and consumes
//! the channel until the terminal `result` line. Because the reader closes the
//! channel only after the child exits, a turn that outlives its process
//! still sees every line the process wrote before `ProcessExited`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conduit_core::{AgentSessionId, SessionId};
use conduit_protocol::{Terminal, UserInput, terminal_of};

use crate::backend::LineSink;
use crate::command::{LaunchConfig, TurnParams};
use crate::errors::WorkerError;

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// Lifecycle state of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Ready for a turn.
    Idle,
    /// Running a turn.
    Busy,
    /// Process gone or killed.
    Dead,
}

/// Point-in-time view of a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// OS process id.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Agent conversation token.
    pub agent_session_id: AgentSessionId,
    /// Seconds since spawn.
    pub uptime_secs: u64,
    /// Seconds since the last turn ended (or spawn).
    pub idle_secs: u64,
}

#[derive(Debug)]
struct Lifecycle {
    state: WorkerState,
    last_active: Instant,
}

/// One agent process serving one session.
pub struct Worker {
    session_id: SessionId,
    agent_session_id: AgentSessionId,
    pid: Option<u32>,
    started_at: Instant,
    lifecycle: Arc<Mutex<Lifecycle>>,
    exit_detail: Arc<Mutex<Option<String>>>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    lines: tokio::sync::Mutex<mpsc::Receiver<String>>,
    kill: CancellationToken,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Launch a persistent agent process. Must be called inside a tokio runtime.
    #[instrument(skip(config, params), fields(session_id = %params.session_id, resume = params.resume))]
    pub fn spawn(config: &LaunchConfig, params: &TurnParams) -> Result<Arc<Self>, WorkerError> {
        let command = config.persistent(params);
        let mut cmd = command.to_command();
        let _ = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            WorkerError::Spawn(format!("{} in {}: {e}", command.program, command.work_dir.display()))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(WorkerError::Spawn("agent stdio not captured".into()));
        };

        let pid = child.id();
        let now = Instant::now();
        let lifecycle = Arc::new(Mutex::new(Lifecycle {
            state: WorkerState::Idle,
            last_active: now,
        }));
        let exit_detail = Arc::new(Mutex::new(None));
        let kill = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.line_buffer.max(1));

        let _reader = tokio::spawn(pump_output(
            params.session_id,
            child,
            stdout,
            stderr,
            tx,
            kill.clone(),
            Arc::clone(&lifecycle),
            Arc::clone(&exit_detail),
        ));

        info!(pid, agent_session_id = %params.agent_session_id, "agent worker spawned");

        Ok(Arc::new(Self {
            session_id: params.session_id,
            agent_session_id: params.agent_session_id.clone(),
            pid,
            started_at: now,
            lifecycle,
            exit_detail,
            stdin: tokio::sync::Mutex::new(stdin),
            lines: tokio::sync::Mutex::new(rx),
            kill,
        }))
    }

    /// Session this worker serves.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Agent conversation token the process was started with.
    pub fn agent_session_id(&self) -> &AgentSessionId {
        &self.agent_session_id
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.lifecycle.lock().state
    }

    /// Whether the process is gone.
    pub fn is_dead(&self) -> bool {
        self.state() == WorkerState::Dead
    }

    /// Time since the last turn ended.
    pub fn idle_for(&self) -> Duration {
        self.lifecycle.lock().last_active.elapsed()
    }

    /// Snapshot for status reporting.
    pub fn info(&self) -> WorkerInfo {
        let lifecycle = self.lifecycle.lock();
        WorkerInfo {
            pid: self.pid,
            state: lifecycle.state,
            agent_session_id: self.agent_session_id.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            idle_secs: lifecycle.last_active.elapsed().as_secs(),
        }
    }

    /// Terminate the process. Idempotent.
    pub fn kill(&self) {
        let was = std::mem::replace(&mut self.lifecycle.lock().state, WorkerState::Dead);
        self.kill.cancel();
        if was != WorkerState::Dead {
            debug!(session_id = %self.session_id, pid = self.pid, "agent worker killed");
        }
    }

    /// Run one turn: write the query, forward output lines until `result`.
    pub async fn send(
        &self,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        self.begin_turn()?;
        let _busy = BusyGuard(self);

        let input = UserInput::new(query).to_line()?;
        {
            let mut stdin = self.stdin.lock().await;
            let written = async {
                stdin.write_all(input.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(error) = written {
                warn!(session_id = %self.session_id, %error, "failed to write query to agent");
                self.kill();
                return Err(WorkerError::ProcessExited {
                    detail: format!("stdin write failed: {error}"),
                });
            }
        }

        let mut lines = self.lines.lock().await;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(session_id = %self.session_id, "turn cancelled, killing worker");
                    self.kill();
                    return Err(WorkerError::Cancelled);
                }
                next = lines.recv() => match next {
                    Some(line) => {
                        on_line(&line);
                        match terminal_of(&line) {
                            Some(Terminal::Completed) => return Ok(()),
                            Some(Terminal::ExecutionError(detail)) => {
                                return Err(WorkerError::Agent(detail));
                            }
                            None => {}
                        }
                    }
                    None => {
                        let detail = self
                            .exit_detail
                            .lock()
                            .clone()
                            .unwrap_or_else(|| "output closed".to_string());
                        return Err(WorkerError::ProcessExited { detail });
                    }
                },
            }
        }
    }

    fn begin_turn(&self) -> Result<(), WorkerError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            WorkerState::Dead => Err(WorkerError::Dead),
            WorkerState::Busy => Err(WorkerError::Busy),
            WorkerState::Idle => {
                lifecycle.state = WorkerState::Busy;
                lifecycle.last_active = Instant::now();
                Ok(())
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Returns the worker to idle when a turn ends, unless it died meanwhile.
struct BusyGuard<'a>(&'a Worker);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.0.lifecycle.lock();
        if lifecycle.state == WorkerState::Busy {
            lifecycle.state = WorkerState::Idle;
        }
        lifecycle.last_active = Instant::now();
    }
}

/// Reader task: owns the child for its whole life.
#[allow(clippy::too_many_arguments)]
async fn pump_output(
    session_id: SessionId,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::Sender<String>,
    kill: CancellationToken,
    lifecycle: Arc<Mutex<Lifecycle>>,
    exit_detail: Arc<Mutex<Option<String>>>,
) {
    let stderr_task = tokio::spawn(collect_stderr(session_id, stderr));
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            () = kill.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tokio::select! {
                        () = kill.cancelled() => break,
                        sent = tx.send(line) => if sent.is_err() { break },
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%session_id, %error, "failed reading agent output");
                    break;
                }
            },
        }
    }

    if kill.is_cancelled() {
        let _ = child.start_kill();
    }
    let status = match child.wait().await {
        Ok(status) => status.to_string(),
        Err(error) => format!("wait failed: {error}"),
    };
    let tail = stderr_task.await.unwrap_or_default();
    let detail = if tail.is_empty() {
        status
    } else {
        format!("{status}; stderr: {tail}")
    };
    if kill.is_cancelled() {
        debug!(%session_id, %detail, "agent worker exited after kill");
    } else {
        warn!(%session_id, %detail, "agent worker exited");
    }

    *exit_detail.lock() = Some(detail);
    lifecycle.lock().state = WorkerState::Dead;
    drop(tx);
}

/// Log stderr lines and return the last few kilobytes.
pub(crate) async fn collect_stderr(session_id: SessionId, stderr: ChildStderr) -> String {
    let mut tail = String::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!(%session_id, stderr = %line, "agent stderr");
        if !tail.is_empty() {
            tail.push('\n');
        }
        tail.push_str(&line);
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            let _ = tail.drain(..cut);
        }
    }
    tail
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{FakeAgent, collect_lines};
    use assert_matches::assert_matches;

    fn params() -> TurnParams {
        TurnParams::new(SessionId::new(1), AgentSessionId::from("tok"), false)
    }

    #[tokio::test]
    async fn send_streams_until_result() {
        let agent = FakeAgent::echo();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.pid().is_some());

        let (result, lines) = collect_lines(&worker, "hello").await;
        result.unwrap();
        assert!(lines.iter().any(|l| l.contains("hello")));
        assert!(lines.last().unwrap().contains("\"result\""));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn worker_serves_consecutive_turns() {
        let agent = FakeAgent::echo();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let (first, _) = collect_lines(&worker, "one").await;
        let (second, lines) = collect_lines(&worker, "two").await;
        first.unwrap();
        second.unwrap();
        assert!(lines.iter().any(|l| l.contains("two")));
    }

    #[tokio::test]
    async fn execution_error_result_is_agent_error() {
        let agent = FakeAgent::execution_error();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let (result, _) = collect_lines(&worker, "x").await;
        assert_matches!(result, Err(WorkerError::Agent(_)));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn result_with_unexpected_fields_ends_turn() {
        let agent = FakeAgent::malformed_title_result();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let (result, lines) = collect_lines(&worker, "x").await;
        result.unwrap();
        assert!(lines[0].contains("\"title\":{"));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn process_death_mid_turn() {
        let agent = FakeAgent::crash_after_partial();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let (result, lines) = collect_lines(&worker, "x").await;
        assert_matches!(result, Err(WorkerError::ProcessExited { .. }));
        assert!(lines.iter().any(|l| l.contains("partial")));
        assert!(worker.is_dead());

        let (again, _) = collect_lines(&worker, "y").await;
        assert_matches!(again, Err(WorkerError::Dead));
    }

    #[tokio::test]
    async fn cancel_kills_worker() {
        let agent = FakeAgent::hang();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let mut sink = |_: &str| {};
        let result = worker.send("x", &cancel, &mut sink).await;
        assert_matches!(result, Err(WorkerError::Cancelled));
        assert!(worker.is_dead());
    }

    #[tokio::test]
    async fn busy_worker_fails_fast() {
        let agent = FakeAgent::hang();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let running = Arc::clone(&worker);
        let cancel = CancellationToken::new();
        let turn_cancel = cancel.clone();
        let turn = tokio::spawn(async move {
            let mut sink = |_: &str| {};
            running.send("first", &turn_cancel, &mut sink).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(worker.state(), WorkerState::Busy);

        let mut sink = |_: &str| {};
        let second = worker.send("second", &CancellationToken::new(), &mut sink).await;
        assert_matches!(second, Err(WorkerError::Busy));

        cancel.cancel();
        assert_matches!(turn.await.unwrap(), Err(WorkerError::Cancelled));
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let agent = FakeAgent::echo();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        worker.kill();
        worker.kill();
        assert!(worker.is_dead());
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let config = LaunchConfig::new("/nonexistent/agent-binary");
        let result = Worker::spawn(&config, &params());
        assert_matches!(result, Err(WorkerError::Spawn(_)));
    }

    #[tokio::test]
    async fn info_reports_state() {
        let agent = FakeAgent::echo();
        let worker = Worker::spawn(&agent.config(), &params()).unwrap();
        let info = worker.info();
        assert_eq!(info.state, WorkerState::Idle);
        assert_eq!(info.agent_session_id.as_str(), "tok");
        assert!(info.uptime_secs < 5);
    }
}
