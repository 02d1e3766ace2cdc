//! Session storage seam.
//!
//! Durable persistence lives outside this workspace; the scheduler only needs
//! the operations on [`SessionStore`]. [`MemoryStore`] backs tests and the
//! standalone binary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use conduit_core::{AgentSessionId, MessageId, Role, SessionId, TokenUsage, TurnMetadata};

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Referenced session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Backend-specific failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A stored session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id.
    pub id: SessionId,
    /// Display title.
    pub title: String,
    /// Working directory for the agent.
    pub work_dir: Option<String>,
    /// Agent conversation token, once a turn has run.
    pub agent_session_id: Option<AgentSessionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// A stored message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message id, monotonic across sessions.
    pub id: MessageId,
    /// Owning session.
    pub session_id: SessionId,
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
    /// Tool steps and reasoning summary for assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TurnMetadata>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Token usage attributed to one assistant message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Owning session.
    pub session_id: SessionId,
    /// Assistant message the usage belongs to.
    pub message_id: MessageId,
    /// Counters.
    pub usage: TokenUsage,
}

/// Operations the scheduler needs from storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session.
    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Create a session.
    async fn create_session(
        &self,
        title: &str,
        work_dir: Option<&str>,
    ) -> Result<SessionRecord, StoreError>;

    /// Append a message and return its id.
    async fn append_message(
        &self,
        session_id: SessionId,
        role: Role,
        content: &str,
        metadata: Option<TurnMetadata>,
    ) -> Result<MessageId, StoreError>;

    /// User messages of `session_id` with id greater than `after`, oldest first.
    async fn pending_user_messages(
        &self,
        session_id: SessionId,
        after: MessageId,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// The newest `limit` messages of `session_id`, oldest first.
    async fn recent_messages(
        &self,
        session_id: SessionId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Record usage for an assistant message.
    async fn append_usage(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        usage: &TokenUsage,
    ) -> Result<(), StoreError>;

    /// Replace the session title.
    async fn update_title(&self, session_id: SessionId, title: &str) -> Result<(), StoreError>;

    /// Replace the agent conversation token.
    async fn update_agent_session_id(
        &self,
        session_id: SessionId,
        agent_session_id: &AgentSessionId,
    ) -> Result<(), StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    sessions: BTreeMap<SessionId, SessionRecord>,
    messages: Vec<MessageRecord>,
    usage: Vec<UsageRecord>,
}

/// Process-local [`SessionStore`]. Contents are lost on exit.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_session: AtomicI64,
    next_message: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store. Ids start at 1.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_session: AtomicI64::new(1),
            next_message: AtomicI64::new(1),
        }
    }

    /// All messages of a session, oldest first.
    pub fn messages(&self, session_id: SessionId) -> Vec<MessageRecord> {
        self.tables
            .read()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    /// All usage records of a session.
    pub fn usage(&self, session_id: SessionId) -> Vec<UsageRecord> {
        self.tables
            .read()
            .usage
            .iter()
            .filter(|u| u.session_id == session_id)
            .copied()
            .collect()
    }

    /// Number of sessions.
    pub fn session_count(&self) -> usize {
        self.tables.read().sessions.len()
    }

    fn touch(
        &self,
        session_id: SessionId,
        update: impl FnOnce(&mut SessionRecord),
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound(session_id))?;
        update(session);
        session.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.tables.read().sessions.get(&id).cloned())
    }

    async fn create_session(
        &self,
        title: &str,
        work_dir: Option<&str>,
    ) -> Result<SessionRecord, StoreError> {
        let now = Utc::now();
        let record = SessionRecord {
            id: SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed)),
            title: title.to_string(),
            work_dir: work_dir.map(str::to_string),
            agent_session_id: None,
            created_at: now,
            updated_at: now,
        };
        let _ = self
            .tables
            .write()
            .sessions
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn append_message(
        &self,
        session_id: SessionId,
        role: Role,
        content: &str,
        metadata: Option<TurnMetadata>,
    ) -> Result<MessageId, StoreError> {
        let mut tables = self.tables.write();
        if !tables.sessions.contains_key(&session_id) {
            return Err(StoreError::SessionNotFound(session_id));
        }
        // Allocated under the write lock so ids and insertion order agree.
        let id = MessageId::new(self.next_message.fetch_add(1, Ordering::Relaxed));
        tables.messages.push(MessageRecord {
            id,
            session_id,
            role,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn pending_user_messages(
        &self,
        session_id: SessionId,
        after: MessageId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && m.role == Role::User && m.id > after)
            .cloned()
            .collect())
    }

    async fn recent_messages(
        &self,
        session_id: SessionId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let tables = self.tables.read();
        let mut recent: Vec<_> = tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn append_usage(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        usage: &TokenUsage,
    ) -> Result<(), StoreError> {
        self.tables.write().usage.push(UsageRecord {
            session_id,
            message_id,
            usage: *usage,
        });
        Ok(())
    }

    async fn update_title(&self, session_id: SessionId, title: &str) -> Result<(), StoreError> {
        self.touch(session_id, |s| s.title = title.to_string())
    }

    async fn update_agent_session_id(
        &self,
        session_id: SessionId,
        agent_session_id: &AgentSessionId,
    ) -> Result<(), StoreError> {
        self.touch(session_id, |s| {
            s.agent_session_id = Some(agent_session_id.clone());
        })
    }
}
