//! Test doubles: a recording sink and a scripted agent backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use conduit_core::{EventKind, HubEvent, SessionId, StreamingStatus};
use conduit_worker::{AgentBackend, AgentWorker, LineSink, TurnParams, WorkerError};

use crate::active_stream::EventSink;

/// Sink that keeps every event it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<HubEvent>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind.name()).collect()
    }

    pub(crate) fn chunks(&self) -> String {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn statuses(&self) -> Vec<StreamingStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::StreamingStatus { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &HubEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Agent output lines.
pub(crate) mod lines {
    use serde_json::json;

    fn text_delta(text: &str) -> String {
        json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            }
        })
        .to_string()
    }

    fn success(result: Option<&str>, title: Option<&str>) -> String {
        let mut line = json!({"type": "result", "subtype": "success"});
        if let Some(result) = result {
            line["result"] = json!(result);
        }
        if let Some(title) = title {
            line["title"] = json!(title);
        }
        line.to_string()
    }

    /// Text deltas without a terminal result.
    pub(crate) fn text_turn_unterminated(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| text_delta(p)).collect()
    }

    /// Text deltas followed by a success result.
    pub(crate) fn text_turn(parts: &[&str]) -> Vec<String> {
        let mut out = text_turn_unterminated(parts);
        out.push(success(None, None));
        out
    }

    /// Usage, one text delta, and a titled result.
    pub(crate) fn full_turn(text: &str, title: &str) -> Vec<String> {
        vec![
            json!({
                "type": "stream_event",
                "event": {"type": "message_start", "message": {"usage": {"input_tokens": 100}}}
            })
            .to_string(),
            text_delta(text),
            json!({
                "type": "stream_event",
                "event": {"type": "message_delta", "usage": {"output_tokens": 12}}
            })
            .to_string(),
            success(Some(text), Some(title)),
        ]
    }
}

/// What one acquired worker does on `send`.
pub(crate) struct TurnScript {
    lines: Vec<String>,
    error: Option<fn() -> WorkerError>,
    gate: Option<Arc<Notify>>,
    until_cancelled: bool,
}

impl TurnScript {
    pub(crate) fn ok(lines: Vec<String>) -> Self {
        Self {
            lines,
            error: None,
            gate: None,
            until_cancelled: false,
        }
    }

    pub(crate) fn failing(lines: Vec<String>, error: fn() -> WorkerError) -> Self {
        Self {
            error: Some(error),
            ..Self::ok(lines)
        }
    }

    /// Wait for `gate` before producing output.
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Produce output, then block until cancelled.
    pub(crate) fn until_cancelled(mut self) -> Self {
        self.until_cancelled = true;
        self
    }
}

#[derive(Default)]
struct Record {
    acquired: Vec<TurnParams>,
    queries: Vec<String>,
    discarded: Vec<SessionId>,
}

/// Backend handing out one scripted worker per acquire, in order.
pub(crate) struct ScriptedBackend {
    scripts: Mutex<VecDeque<TurnScript>>,
    record: Arc<Mutex<Record>>,
}

impl ScriptedBackend {
    pub(crate) fn new(scripts: Vec<TurnScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            record: Arc::default(),
        }
    }

    pub(crate) fn acquired(&self) -> Vec<TurnParams> {
        self.record.lock().acquired.clone()
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.record.lock().queries.clone()
    }

    pub(crate) fn discarded(&self) -> Vec<SessionId> {
        self.record.lock().discarded.clone()
    }

    /// Wait until `n` queries have reached workers.
    pub(crate) async fn wait_for_queries(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.record.lock().queries.len() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("queries never arrived");
    }
}

struct ScriptedWorker {
    script: Mutex<Option<TurnScript>>,
    record: Arc<Mutex<Record>>,
}

#[async_trait]
impl AgentWorker for ScriptedWorker {
    async fn send(
        &self,
        query: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        self.record.lock().queries.push(query.to_string());
        let Some(script) = self.script.lock().take() else {
            return Err(WorkerError::Dead);
        };
        if let Some(gate) = &script.gate {
            tokio::select! {
                () = gate.notified() => {}
                () = cancel.cancelled() => return Err(WorkerError::Cancelled),
            }
        }
        for line in &script.lines {
            on_line(line);
        }
        if script.until_cancelled {
            cancel.cancelled().await;
            return Err(WorkerError::Cancelled);
        }
        match script.error {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn acquire(&self, params: &TurnParams) -> Result<Arc<dyn AgentWorker>, WorkerError> {
        self.record.lock().acquired.push(params.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or(WorkerError::Unavailable)?;
        Ok(Arc::new(ScriptedWorker {
            script: Mutex::new(Some(script)),
            record: Arc::clone(&self.record),
        }))
    }

    fn discard(&self, session_id: SessionId) {
        self.record.lock().discarded.push(session_id);
    }

    async fn one_shot(
        &self,
        _params: &TurnParams,
        _query: &str,
        _cancel: &CancellationToken,
        _on_line: &mut LineSink<'_>,
    ) -> Result<(), WorkerError> {
        Err(WorkerError::OneShot("no script left".into()))
    }
}
