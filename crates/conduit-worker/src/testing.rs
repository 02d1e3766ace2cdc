//! Scripted stand-ins for the agent CLI, used by unit tests.

use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::command::LaunchConfig;
use crate::errors::WorkerError;
use crate::worker::Worker;

const TEXT_OK: &str = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}}"#;
const RESULT_OK: &str = r#"{"type":"result","subtype":"success","result":"ok"}"#;

/// A POSIX shell script run through `/bin/sh` in place of the agent binary.
pub(crate) struct FakeAgent {
    dir: TempDir,
}

impl FakeAgent {
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("agent.sh"), body).expect("write script");
        Self { dir }
    }

    /// Echoes each input line, streams "ok", then a success result. Loops.
    pub(crate) fn echo() -> Self {
        Self::new(&format!(
            "while IFS= read -r line; do\n\
             printf '{{\"type\":\"system\",\"subtype\":\"echo\",\"input\":%s}}\\n' \"$line\"\n\
             printf '%s\\n' '{TEXT_OK}'\n\
             printf '%s\\n' '{RESULT_OK}'\n\
             done\n"
        ))
    }

    /// Answers every turn with `error_during_execution`.
    pub(crate) fn execution_error() -> Self {
        Self::new(
            "while IFS= read -r line; do\n\
             printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"is_error\":true,\"result\":\"tool crashed\"}'\n\
             done\n",
        )
    }

    /// Answers every turn with a success result whose title is an object.
    pub(crate) fn malformed_title_result() -> Self {
        Self::new(
            "while IFS= read -r line; do\n\
             printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\",\"title\":{\"text\":\"x\"}}'\n\
             done\n",
        )
    }

    /// Streams a partial delta, writes to stderr, exits non-zero.
    pub(crate) fn crash_after_partial() -> Self {
        Self::new(
            "IFS= read -r line\n\
             printf '%s\\n' '{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"partial\"}}}'\n\
             echo 'boom' >&2\n\
             exit 3\n",
        )
    }

    /// Reads one line and never answers.
    pub(crate) fn hang() -> Self {
        Self::new("IFS= read -r line\nexec sleep 30\n")
    }

    /// One-shot style: prints the last argument, streams "ok", exits 0.
    pub(crate) fn one_shot_echo() -> Self {
        Self::new(&format!(
            "for last; do :; done\n\
             printf '{{\"type\":\"system\",\"subtype\":\"args\",\"last\":\"%s\"}}\\n' \"$last\"\n\
             printf '%s\\n' '{TEXT_OK}'\n\
             printf '%s\\n' '{RESULT_OK}'\n"
        ))
    }

    /// One-shot style: complains on stderr and exits 1 without output.
    pub(crate) fn one_shot_auth_failure() -> Self {
        Self::new("echo 'invalid api key' >&2\nexit 1\n")
    }

    /// One-shot style: streams output, then exits 2 with a quiet stderr.
    pub(crate) fn one_shot_output_then_exit() -> Self {
        Self::new(&format!("printf '%s\\n' '{TEXT_OK}'\nexit 2\n"))
    }

    /// Launch config running this script.
    pub(crate) fn config(&self) -> LaunchConfig {
        LaunchConfig {
            binary_args: vec![self.dir.path().join("agent.sh").display().to_string()],
            default_work_dir: Some(self.dir.path().to_path_buf()),
            ..LaunchConfig::new("/bin/sh")
        }
    }
}

/// Run one turn on `worker`, collecting every forwarded line.
pub(crate) async fn collect_lines(
    worker: &Worker,
    query: &str,
) -> (Result<(), WorkerError>, Vec<String>) {
    let mut lines = Vec::new();
    let cancel = CancellationToken::new();
    let result = {
        let mut sink = |line: &str| lines.push(line.to_string());
        tokio::time::timeout(Duration::from_secs(10), worker.send(query, &cancel, &mut sink))
            .await
            .expect("turn timed out")
    };
    (result, lines)
}
