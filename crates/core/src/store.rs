//! Store trait: durable persistence for sessions, messages and file snapshots.
//!
//! Implementations serialize every mutation through a single writer, commit
//! each operation atomically, and publish the matching event on the session
//! or message [`Broker`](crate::event::Broker) after the commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::Message;
use crate::session::Session;

/// Last-observed content of a workspace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// Canonical absolute path
    pub path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileSnapshot {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    // --- Sessions ---

    async fn create_session(&self, session: Session) -> Result<Session, StoreError>;

    async fn get_session(&self, id: &str) -> Result<Session, StoreError>;

    /// All sessions, most recently updated first.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// Sessions whose parent is `parent_id`, oldest first.
    async fn list_child_sessions(&self, parent_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Replace the mutable fields (title, counters, summary anchor).
    async fn update_session(&self, session: Session) -> Result<Session, StoreError>;

    /// Atomically add usage to a session's counters.
    async fn accumulate_usage(
        &self,
        id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Result<Session, StoreError>;

    /// Delete a session, its messages, and its child sessions.
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;

    // --- Messages ---

    async fn create_message(&self, message: Message) -> Result<Message, StoreError>;

    async fn get_message(&self, id: &str) -> Result<Message, StoreError>;

    /// Messages of a session in creation order.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Overwrite parts, usage and finish. Fails for finished messages.
    async fn update_message(&self, message: Message) -> Result<Message, StoreError>;

    async fn delete_message(&self, id: &str) -> Result<(), StoreError>;

    // --- Files ---

    /// Insert or replace the snapshot for `snapshot.path`.
    async fn upsert_file(&self, snapshot: FileSnapshot) -> Result<FileSnapshot, StoreError>;

    async fn get_file(&self, path: &str) -> Result<Option<FileSnapshot>, StoreError>;
}
