//! In-process agent stand-in for gateway unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use conduit_core::SessionId;
use conduit_runtime::{ActiveStreamRegistry, EventEmitter, MemoryStore, TurnScheduler, UsageLedger};
use conduit_worker::{AgentBackend, AgentWorker, LineSink, TurnParams, WorkerError};

/// What every turn does.
#[derive(Clone)]
pub(crate) struct FakeScript {
    lines: Vec<String>,
    hold: bool,
}

impl FakeScript {
    /// Streams `parts` as text deltas followed by a success result.
    pub(crate) fn replying(parts: &[&str]) -> Self {
        let mut lines: Vec<String> = parts
            .iter()
            .map(|text| {
                json!({
                    "type": "stream_event",
                    "event": {
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text}
                    }
                })
                .to_string()
            })
            .collect();
        lines.push(json!({"type": "result", "subtype": "success"}).to_string());
        Self { lines, hold: false }
    }

    /// Produces nothing until cancelled.
    pub(crate) fn holding() -> Self {
        Self {
            lines: Vec::new(),
            hold: true,
        }
    }

    async fn play(
        &self,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        for line in &self.lines {
            on_line(line);
        }
        if self.hold {
            cancel.cancelled().await;
            return Err(WorkerError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl AgentWorker for FakeScript {
    async fn send(
        &self,
        _query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        self.play(cancel, on_line).await
    }
}

/// Backend running the same script for every turn.
pub(crate) struct FakeBackend(FakeScript);

#[async_trait]
impl AgentBackend for FakeBackend {
    fn acquire(&self, _params: &TurnParams) -> Result<Arc<dyn AgentWorker>, WorkerError> {
        Ok(Arc::new(self.0.clone()))
    }

    fn discard(&self, _session_id: SessionId) {}

    async fn one_shot(
        &self,
        _params: &TurnParams,
        _query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        self.0.play(cancel, on_line).await
    }
}

/// Scheduler over an in-memory store running `script` for every turn.
pub(crate) fn scheduler(script: FakeScript) -> (Arc<TurnScheduler>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(TurnScheduler::new(
        store.clone(),
        Arc::new(FakeBackend(script)),
        Arc::new(ActiveStreamRegistry::new()),
        Arc::new(EventEmitter::new()),
        Arc::new(UsageLedger::new()),
    ));
    (scheduler, store)
}
