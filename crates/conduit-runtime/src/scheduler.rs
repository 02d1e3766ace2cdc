//! Turn scheduling: one in-flight turn per session, later messages queued.
//!
//! `submit` stores the user message first, then either registers an
//! [`ActiveStream`] and spawns the session's turn task, or (when a turn is
//! already running) broadcasts `message_queued`. The turn task drains the
//! queue itself: after each turn it merges every user message newer than the
//! session's consumed marker into the next query.
//!
//! A stopped turn still drains the queue. Deleting the session or shutting
//! the scheduler down closes the stream instead, and nothing is replayed.
//!
//! `compress` restarts the agent conversation: the worker is discarded, a new
//! agent token is stored and a fresh turn runs on a recap of the newest
//! messages.
//!
//! Lost wakeups are avoided by ordering. Submitters store before trying to
//! register; the turn task deregisters before its final pending check. A
//! message is therefore either seen by that check or its submitter finds the
//! registry free and starts the turn itself.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use conduit_core::metric_names::{
    MESSAGES_QUEUED_TOTAL, TURN_DURATION_SECONDS, TURN_ERRORS_TOTAL, TURNS_ACTIVE, TURNS_TOTAL,
};
use conduit_core::{
    AgentSessionId, Delivery, EventKind, HubEvent, MessageId, Role, SessionId, StreamingStatus,
};
use conduit_protocol::{DemuxLimits, TurnDemux, truncate_chars};
use conduit_worker::{AgentBackend, RecoveryOrchestrator, TurnParams};

use crate::active_stream::{ActiveStream, ActiveStreamRegistry, AttachedSink, EventSink};
use crate::emitter::EventEmitter;
use crate::errors::RuntimeError;
use crate::store::{MessageRecord, SessionStore};
use crate::usage::UsageLedger;

/// Characters of the first query used as a new session's title.
const TITLE_CHARS: usize = 60;

/// Separator between merged queued messages.
const QUEUE_SEPARATOR: &str = "\n\n";

/// Messages recapped when a session is compressed.
const COMPRESS_HISTORY: usize = 10;

/// Characters kept per recapped message.
const COMPRESS_MESSAGE_CHARS: usize = 500;

/// User message stored when a session is compressed.
const COMPRESSED_NOTICE: &str = "[system] Context compressed, agent session reset.";

const RECAP_HEADER: &str = "[Context recovery] The previous conversation was compressed because \
its context grew too long. These are the most recent messages; continue from them:\n\n";

const RECAP_FOOTER: &str = "---\nContinue with the request in the last user message above. \
Finish any task that was left incomplete.";

/// A message to run against a session.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// Target session.
    pub session_id: SessionId,
    /// User text.
    pub query: String,
    /// Working directory override.
    pub work_dir: Option<String>,
    /// Whether the session was just created (start rather than resume).
    pub is_new_session: bool,
}

/// What `submit` did with the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A turn was started.
    Started(MessageId),
    /// A turn is running; the message will be merged into the next one.
    Queued(MessageId),
}

impl SubmitOutcome {
    /// Stored id of the user message.
    pub fn message_id(self) -> MessageId {
        match self {
            Self::Started(id) | Self::Queued(id) => id,
        }
    }
}

/// Per-turn input carried across queue drains.
struct TurnContext {
    work_dir: Option<String>,
    is_new_session: bool,
    /// Replaces the merged pending messages for the first turn only.
    query: Option<String>,
}

/// Drives turns for every session.
pub struct TurnScheduler {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn AgentBackend>,
    orchestrator: RecoveryOrchestrator,
    streams: Arc<ActiveStreamRegistry>,
    emitter: Arc<EventEmitter>,
    ledger: Arc<UsageLedger>,
    consumed: DashMap<SessionId, MessageId>,
    limits: DemuxLimits,
    tasks: TaskTracker,
}

impl TurnScheduler {
    /// Scheduler over `store` and `backend`.
    pub fn new(
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn AgentBackend>,
        streams: Arc<ActiveStreamRegistry>,
        emitter: Arc<EventEmitter>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            store,
            orchestrator: RecoveryOrchestrator::new(Arc::clone(&backend)),
            backend,
            streams,
            emitter,
            ledger,
            consumed: DashMap::new(),
            limits: DemuxLimits::default(),
            tasks: TaskTracker::new(),
        }
    }

    /// Override the demultiplexer's accumulation limits.
    #[must_use]
    pub fn with_limits(mut self, limits: DemuxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Active stream registry.
    pub fn streams(&self) -> &Arc<ActiveStreamRegistry> {
        &self.streams
    }

    /// Lifecycle event emitter.
    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// External usage ledger.
    ///
    /// Collaborators that meter the agent's model traffic (a metering proxy
    /// between the agent CLI and its provider, for instance) report through
    /// [`UsageLedger::accumulate`]. Totals captured during a turn replace the
    /// usage parsed from the agent's own stream.
    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Store a user message and start or queue a turn. Never waits for the turn.
    pub async fn submit(
        self: &Arc<Self>,
        request: SubmitRequest,
    ) -> Result<SubmitOutcome, RuntimeError> {
        self.submit_with_viewer(request, None).await
    }

    /// Like [`submit`](Self::submit), attaching `viewer` to the turn.
    ///
    /// A started turn gets the viewer installed before its task is spawned,
    /// so no event is missed. A queued message subscribes the viewer to the
    /// turn already running.
    #[instrument(skip_all, fields(session_id = %request.session_id))]
    pub async fn submit_with_viewer(
        self: &Arc<Self>,
        request: SubmitRequest,
        viewer: Option<AttachedSink>,
    ) -> Result<SubmitOutcome, RuntimeError> {
        let session_id = request.session_id;
        if self.store.get_session(session_id).await?.is_none() {
            return Err(RuntimeError::SessionNotFound(session_id));
        }

        self.ensure_marker(session_id).await?;
        let message_id = self
            .store
            .append_message(session_id, Role::User, &request.query, None)
            .await?;

        let Some(stream) = self.streams.try_register(session_id) else {
            debug!(%message_id, "turn in flight, message queued");
            if let Some(viewer) = viewer {
                let _ = self.streams.subscribe(session_id, &viewer.id, viewer.sink);
            }
            metrics::counter!(MESSAGES_QUEUED_TOTAL).increment(1);
            let _ = self.emitter.emit(HubEvent::now(
                session_id,
                EventKind::MessageQueued {
                    content: request.query,
                },
            ));
            return Ok(SubmitOutcome::Queued(message_id));
        };

        if let Some(viewer) = viewer {
            stream.swap_sink(&viewer.id, viewer.sink, None);
        }
        self.spawn_drive(
            stream,
            TurnContext {
                work_dir: request.work_dir,
                is_new_session: request.is_new_session,
                query: None,
            },
        );
        Ok(SubmitOutcome::Started(message_id))
    }

    /// Start the consumed marker at the session's newest stored message.
    ///
    /// Runs before the first append of this process, so history stored
    /// earlier is never replayed and a concurrent submitter's message is
    /// never skipped.
    async fn ensure_marker(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        if self.consumed.contains_key(&session_id) {
            return Ok(());
        }
        let newest = self
            .store
            .recent_messages(session_id, 1)
            .await?
            .last()
            .map_or(MessageId::new(0), |m| m.id);
        let _ = self.consumed.entry(session_id).or_insert(newest);
        Ok(())
    }

    fn spawn_drive(self: &Arc<Self>, stream: Arc<ActiveStream>, ctx: TurnContext) {
        let scheduler = Arc::clone(self);
        let _ = self
            .tasks
            .spawn(async move { scheduler.drive(stream, ctx).await });
    }

    /// Restart the session's agent conversation from a recap of its history.
    ///
    /// Discards the session's worker, stores a new agent token and a notice
    /// message, then runs a fresh turn whose query recaps the newest
    /// messages. Refused while a turn is in flight. Returns the new token.
    #[instrument(skip(self))]
    pub async fn compress(
        self: &Arc<Self>,
        session_id: SessionId,
    ) -> Result<AgentSessionId, RuntimeError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(RuntimeError::SessionNotFound(session_id));
        }
        let Some(stream) = self.streams.try_register(session_id) else {
            return Err(RuntimeError::SessionStreaming(session_id));
        };

        let prepared = self.prepare_compress(session_id).await;
        // The slot is held either way: the task drains anything queued meanwhile.
        let ctx = match &prepared {
            Ok((_, recap)) => TurnContext {
                work_dir: None,
                is_new_session: true,
                query: Some(recap.clone()),
            },
            Err(_) => TurnContext {
                work_dir: None,
                is_new_session: false,
                query: None,
            },
        };
        self.spawn_drive(stream, ctx);
        let (token, _) = prepared?;
        info!(agent_session_id = %token, "session compressed");
        Ok(token)
    }

    async fn prepare_compress(
        &self,
        session_id: SessionId,
    ) -> Result<(AgentSessionId, String), RuntimeError> {
        self.ensure_marker(session_id).await?;
        let recent = self
            .store
            .recent_messages(session_id, COMPRESS_HISTORY)
            .await?;
        let recap = recap_query(&recent);

        self.backend.discard(session_id);
        let token = AgentSessionId::generate();
        self.store
            .update_agent_session_id(session_id, &token)
            .await?;
        let _ = self
            .store
            .append_message(session_id, Role::User, COMPRESSED_NOTICE, None)
            .await?;
        Ok((token, recap))
    }

    /// Create a session titled after the query, announce it, and submit.
    #[instrument(skip_all)]
    pub async fn create_and_submit(
        self: &Arc<Self>,
        query: &str,
        work_dir: Option<&str>,
        viewer: Option<AttachedSink>,
    ) -> Result<(SessionId, SubmitOutcome), RuntimeError> {
        let title = truncate_chars(query.lines().next().unwrap_or_default().trim(), TITLE_CHARS);
        let session = self.store.create_session(&title, work_dir).await?;
        info!(session_id = %session.id, "session created");
        let _ = self.emitter.emit(HubEvent::now(
            session.id,
            EventKind::SessionCreated {
                title: session.title.clone(),
            },
        ));
        let outcome = self
            .submit_with_viewer(
                SubmitRequest {
                    session_id: session.id,
                    query: query.to_string(),
                    work_dir: work_dir.map(str::to_string),
                    is_new_session: true,
                },
                viewer,
            )
            .await?;
        Ok((session.id, outcome))
    }

    /// Attach a viewer to the session's in-flight turn.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        viewer_id: &str,
        sink: Arc<dyn EventSink>,
    ) -> StreamingStatus {
        self.streams.subscribe(session_id, viewer_id, sink)
    }

    /// Cancel the session's in-flight turn. Returns whether one was running.
    #[instrument(skip(self))]
    pub fn stop(&self, session_id: SessionId) -> bool {
        let stopped = self.streams.cancel(session_id);
        if stopped {
            info!("turn stop requested");
        }
        stopped
    }

    /// Cancel any turn without replaying its queue and kill the session's worker.
    #[instrument(skip(self))]
    pub fn delete_session(&self, session_id: SessionId) {
        let _ = self.streams.close(session_id);
        self.backend.discard(session_id);
        let _ = self.consumed.remove(&session_id);
        info!("session runtime state released");
    }

    /// Cancel every turn and wait for the turn tasks to finish.
    pub async fn shutdown(&self) {
        let _ = self.tasks.close();
        self.streams.close_all();
        self.tasks.wait().await;
        info!("turn scheduler stopped");
    }

    /// Whether any turn task is still running.
    pub fn has_running_turns(&self) -> bool {
        !self.tasks.is_empty()
    }

    // ── turn task ──────────────────────────────────────────────────────

    async fn drive(self: Arc<Self>, first: Arc<ActiveStream>, mut ctx: TurnContext) {
        let session_id = first.session_id();
        let mut stream = first;
        loop {
            let failed = match self.pending(session_id).await {
                Ok(pending) if !pending.is_empty() => {
                    let query = ctx.query.take().unwrap_or_else(|| merge(&pending));
                    self.run_turn(&stream, pending, &query, &ctx).await;
                    ctx.is_new_session = false;
                    false
                }
                Ok(_) => false,
                Err(error) => {
                    error!(%session_id, %error, "failed to read pending messages");
                    true
                }
            };

            let inherited = stream.attached();
            let _ = self.streams.remove(&stream);
            let _ = self
                .emitter
                .emit(HubEvent::status(session_id, StreamingStatus::Idle));

            // Closed streams replay nothing; a released session has nothing pending.
            if failed || stream.is_closed() || self.tasks.is_closed() {
                break;
            }
            match self.pending(session_id).await {
                Ok(pending) if !pending.is_empty() => {}
                _ => break,
            }
            let Some(next) = self.streams.try_register(session_id) else {
                break;
            };
            if let Some(attached) = inherited {
                next.swap_sink(&attached.id, attached.sink, None);
            }
            debug!(%session_id, "draining queued messages");
            stream = next;
        }
    }

    /// User messages after the consumed marker. Empty once the session was released.
    async fn pending(&self, session_id: SessionId) -> Result<Vec<MessageRecord>, RuntimeError> {
        let Some(after) = self.consumed.get(&session_id).map(|m| *m) else {
            return Ok(Vec::new());
        };
        Ok(self.store.pending_user_messages(session_id, after).await?)
    }

    /// Run one turn against the session's worker.
    #[instrument(skip_all, fields(session_id = %stream.session_id(), merged = pending.len()))]
    async fn run_turn(
        &self,
        stream: &Arc<ActiveStream>,
        pending: Vec<MessageRecord>,
        query: &str,
        ctx: &TurnContext,
    ) {
        let session_id = stream.session_id();
        let started = Instant::now();

        if let Some(last) = pending.last() {
            let _ = self.consumed.insert(session_id, last.id);
        }

        let session = match self.store.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!("session vanished before its turn");
                stream.send(&HubEvent::now(session_id, EventKind::Done));
                return;
            }
            Err(error) => {
                error!(%error, "failed to load session");
                stream.send(&HubEvent::now(
                    session_id,
                    EventKind::Error {
                        message: error.to_string(),
                    },
                ));
                stream.send(&HubEvent::now(session_id, EventKind::Done));
                return;
            }
        };

        self.ledger.reset(session_id);
        let _ = self
            .emitter
            .emit(HubEvent::status(session_id, StreamingStatus::Streaming));
        metrics::gauge!(TURNS_ACTIVE).increment(1.0);

        let (token, resume) = match &session.agent_session_id {
            Some(token) => (token.clone(), !ctx.is_new_session),
            None => (AgentSessionId::generate(), false),
        };
        let work_dir = ctx.work_dir.clone().or(session.work_dir.clone());
        let params = TurnParams::new(session_id, token, resume).with_work_dir(work_dir.map(Into::into));

        let mut demux = TurnDemux::with_limits(self.limits);
        let outcome = {
            let mut on_line = |line: &str| {
                for kind in demux.process_line(line) {
                    self.route(stream, HubEvent::now(session_id, kind));
                }
            };
            self.orchestrator
                .run(params, query, stream.cancel_token(), &mut on_line)
                .await
        };

        let cancelled = matches!(&outcome.result, Err(e) if e.is_cancelled());
        let label = match &outcome.result {
            Ok(()) => "ok",
            Err(_) if cancelled => "cancelled",
            Err(_) => "error",
        };
        if let Err(error) = &outcome.result {
            if !cancelled {
                metrics::counter!(TURN_ERRORS_TOTAL, "category" => error.category()).increment(1);
                stream.send(&HubEvent::now(
                    session_id,
                    EventKind::Error {
                        message: error.to_string(),
                    },
                ));
            }
        }

        if session.agent_session_id.as_ref() != Some(&outcome.agent_session_id) {
            if let Err(error) = self
                .store
                .update_agent_session_id(session_id, &outcome.agent_session_id)
                .await
            {
                warn!(%error, "failed to persist agent session token");
            }
        }
        self.persist_reply(session_id, &demux).await;

        stream.send(&HubEvent::now(session_id, EventKind::Done));
        metrics::gauge!(TURNS_ACTIVE).decrement(1.0);
        metrics::counter!(TURNS_TOTAL, "outcome" => label).increment(1);
        metrics::histogram!(TURN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            outcome = label,
            recoveries = outcome.recoveries(),
            one_shot = outcome.one_shot,
            skipped_lines = demux.skipped_lines(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn finished"
        );
    }

    fn route(&self, stream: &ActiveStream, event: HubEvent) {
        match event.kind.delivery() {
            Delivery::Broadcast => {
                let _ = self.emitter.emit(event);
            }
            Delivery::Subscriber => stream.send(&event),
        }
    }

    /// Persist the assistant message (partial text included), usage, and title.
    async fn persist_reply(&self, session_id: SessionId, demux: &TurnDemux) {
        let captured = self.ledger.consume(session_id);
        let text = demux.final_text();
        let metadata = demux.metadata();

        if !text.is_empty() || !metadata.is_empty() {
            let metadata = (!metadata.is_empty()).then_some(metadata);
            match self
                .store
                .append_message(session_id, Role::Assistant, &text, metadata)
                .await
            {
                Ok(message_id) => {
                    let usage = captured.unwrap_or_else(|| demux.usage());
                    if !usage.is_empty() {
                        if let Err(error) =
                            self.store.append_usage(session_id, message_id, &usage).await
                        {
                            warn!(%error, "failed to persist usage");
                        }
                    }
                }
                Err(error) => warn!(%error, "failed to persist assistant message"),
            }
        }

        if let Some(title) = demux.title() {
            if let Err(error) = self.store.update_title(session_id, title).await {
                warn!(%error, "failed to persist session title");
            }
        }
    }
}

/// Queued user messages joined into one query.
fn merge(pending: &[MessageRecord]) -> String {
    pending
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(QUEUE_SEPARATOR)
}

/// Query that restarts a compressed session from its newest messages.
fn recap_query(recent: &[MessageRecord]) -> String {
    let mut query = String::from(RECAP_HEADER);
    for message in recent {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut content = truncate_chars(&message.content, COMPRESS_MESSAGE_CHARS);
        if content.len() < message.content.len() {
            content.push_str("...(truncated)");
        }
        let _ = write!(query, "[{role}]: {content}\n\n");
    }
    query.push_str(RECAP_FOOTER);
    query
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
