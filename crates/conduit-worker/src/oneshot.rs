//! Single non-pooled invocation, used when no persistent worker is available.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::LineSink;
use crate::command::{LaunchConfig, TurnParams};
use crate::errors::WorkerError;
use crate::worker::collect_stderr;

/// Run the agent once with the query as an argument, forwarding every
/// output line.
///
/// A non-zero exit is a failure when stderr has content. With a quiet stderr
/// it still counts as success if any output arrived.
#[instrument(skip_all, fields(session_id = %params.session_id, resume = params.resume))]
pub async fn run_one_shot(
    config: &LaunchConfig,
    params: &TurnParams,
    query: &str,
    cancel: &CancellationToken,
    on_line: &mut LineSink<'_>,
) -> Result<(), WorkerError> {
    let command = config.one_shot(params, query);
    let mut cmd = command.to_command();
    let _ = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| WorkerError::Spawn(format!("{}: {e}", command.program)))?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        return Err(WorkerError::Spawn("agent stdio not captured".into()));
    };
    debug!(pid = child.id(), "one-shot agent started");

    let stderr_task = tokio::spawn(collect_stderr(params.session_id, stderr));
    let mut lines = BufReader::new(stdout).lines();
    let mut received = false;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("one-shot turn cancelled");
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(WorkerError::Cancelled);
            }
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        received = true;
                        on_line(&line);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "failed reading one-shot output");
                    break;
                }
            },
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| WorkerError::OneShot(format!("wait failed: {e}")))?;
    let stderr = stderr_task.await.unwrap_or_default();

    if status.success() {
        return Ok(());
    }
    if !stderr.is_empty() {
        return Err(WorkerError::OneShot(format!("{status}: {stderr}")));
    }
    if received {
        warn!(%status, "one-shot agent exited non-zero after output, keeping result");
        return Ok(());
    }
    Err(WorkerError::OneShot(status.to_string()))
}
