//! SQLite store.
//!
//! One database file with three tables:
//! - `sessions`: session rows, `parent_id` links sub-agent sessions
//! - `messages`: message rows; `seq` gives the chronological order and
//!   `parts` holds the tagged JSON array of content parts
//! - `files`: last-observed file contents keyed by canonical path
//!
//! Timestamps are stored as epoch milliseconds. The schema version is kept
//! in `PRAGMA user_version` and migrations only move forward.

use async_trait::async_trait;
use codeloom_core::error::StoreError;
use codeloom_core::event::EventType;
use codeloom_core::message::{Finish, Message, Role, decode_parts, encode_parts};
use codeloom_core::session::Session;
use codeloom_core::store::{FileSnapshot, Store};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{StoreEvents, from_millis, now};

/// Forward-only schema migrations; index + 1 is the schema version.
const MIGRATIONS: &[&[&str]] = &[&[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id                 TEXT PRIMARY KEY,
        parent_id          TEXT REFERENCES sessions(id) ON DELETE CASCADE,
        title              TEXT NOT NULL,
        message_count      INTEGER NOT NULL DEFAULT 0,
        input_tokens       INTEGER NOT NULL DEFAULT 0,
        output_tokens      INTEGER NOT NULL DEFAULT 0,
        cost               REAL NOT NULL DEFAULT 0.0,
        summary_message_id TEXT,
        created_at         INTEGER NOT NULL,
        updated_at         INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        id            TEXT UNIQUE NOT NULL,
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        role          TEXT NOT NULL,
        parts         TEXT NOT NULL DEFAULT '[]',
        model         TEXT,
        input_tokens  INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        finish_reason TEXT,
        finish_detail TEXT,
        finished_at   INTEGER,
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS files (
        path       TEXT PRIMARY KEY,
        content    TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
]];

const SESSION_COLUMNS: &str = "id, parent_id, title, message_count, input_tokens, output_tokens, \
     cost, summary_message_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, role, parts, model, input_tokens, output_tokens, \
     finish_reason, finish_detail, finished_at, created_at, updated_at";

/// A SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<()>,
    events: StoreEvents,
}

impl SqliteStore {
    /// Open (or create) a store.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(path: &str, events: StoreEvents) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // An in-memory database lives only as long as its connection.
        let pool_options = if path.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool, events).await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool, events: StoreEvents) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            writer: Mutex::new(()),
            events,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn events(&self) -> &StoreEvents {
        &self.events
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("user_version: {e}")))
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let current = self.schema_version().await? as usize;
        for (index, statements) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = index + 1;
            let mut tx = self.begin().await?;
            for sql in *statements {
                sqlx::query(sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::MigrationFailed(format!("v{version}: {e}")))?;
            }
            // PRAGMA does not accept bound parameters.
            sqlx::query(&format!("PRAGMA user_version = {version}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("v{version}: {e}")))?;
            commit(tx).await?;
            debug!(version, "Applied store migration");
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin transaction: {e}")))
    }

    fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
        Ok(Session {
            id: column(row, "id")?,
            parent_id: column(row, "parent_id")?,
            title: column(row, "title")?,
            message_count: column::<i64>(row, "message_count")? as u64,
            input_tokens: column::<i64>(row, "input_tokens")? as u64,
            output_tokens: column::<i64>(row, "output_tokens")? as u64,
            cost: column(row, "cost")?,
            summary_message_id: column(row, "summary_message_id")?,
            created_at: from_millis(column(row, "created_at")?),
            updated_at: from_millis(column(row, "updated_at")?),
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
        let id: String = column(row, "id")?;
        let role: String = column(row, "role")?;
        let role = Role::from_str(&role).map_err(|e| StoreError::Decode(format!("message {id}: {e}")))?;
        let parts_json: String = column(row, "parts")?;
        let parts = decode_parts(&parts_json)
            .map_err(|e| StoreError::Decode(format!("message {id} parts: {e}")))?;

        let finish_reason: Option<String> = column(row, "finish_reason")?;
        let finish = match finish_reason {
            Some(reason) => Some(Finish {
                reason: reason
                    .parse()
                    .map_err(|e| StoreError::Decode(format!("message {id}: {e}")))?,
                detail: column(row, "finish_detail")?,
                time: from_millis(column::<Option<i64>>(row, "finished_at")?.unwrap_or_default()),
            }),
            None => None,
        };

        Ok(Message {
            session_id: column(row, "session_id")?,
            role,
            parts,
            model: column(row, "model")?,
            input_tokens: column::<i64>(row, "input_tokens")? as u64,
            output_tokens: column::<i64>(row, "output_tokens")? as u64,
            finish,
            created_at: from_millis(column(row, "created_at")?),
            updated_at: from_millis(column(row, "updated_at")?),
            id,
        })
    }

    fn row_to_file(row: &SqliteRow) -> Result<FileSnapshot, StoreError> {
        Ok(FileSnapshot {
            path: column(row, "path")?,
            content: column(row, "content")?,
            created_at: from_millis(column(row, "created_at")?),
            updated_at: from_millis(column(row, "updated_at")?),
        })
    }

    async fn fetch_session(
        tx: &mut Transaction<'static, Sqlite>,
        id: &str,
    ) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get session: {e}")))?
            .ok_or_else(|| StoreError::session_not_found(id))?;
        Self::row_to_session(&row)
    }

    async fn fetch_message(
        tx: &mut Transaction<'static, Sqlite>,
        id: &str,
    ) -> Result<Message, StoreError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get message: {e}")))?
            .ok_or_else(|| StoreError::message_not_found(id))?;
        Self::row_to_message(&row)
    }

    async fn bump_message_count(
        tx: &mut Transaction<'static, Sqlite>,
        session_id: &str,
        delta: i64,
    ) -> Result<Session, StoreError> {
        sqlx::query(
            "UPDATE sessions SET message_count = MAX(message_count + ?, 0), updated_at = ? WHERE id = ?",
        )
        .bind(delta)
        .bind(now().timestamp_millis())
        .bind(session_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Storage(format!("update message count: {e}")))?;
        Self::fetch_session(tx, session_id).await
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

async fn commit(tx: Transaction<'static, Sqlite>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| StoreError::Storage(format!("commit: {e}")))
}

fn encode(message: &Message) -> Result<String, StoreError> {
    encode_parts(&message.parts)
        .map_err(|e| StoreError::Storage(format!("encode message {}: {e}", message.id)))
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_session(&self, session: Session) -> Result<Session, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        if let Some(parent) = &session.parent_id {
            Self::fetch_session(&mut tx, parent).await?;
        }
        sqlx::query(
            r#"
            INSERT INTO sessions (id, parent_id, title, message_count, input_tokens, output_tokens,
                                  cost, summary_message_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.parent_id)
        .bind(&session.title)
        .bind(session.message_count as i64)
        .bind(session.input_tokens as i64)
        .bind(session.output_tokens as i64)
        .bind(session.cost)
        .bind(&session.summary_message_id)
        .bind(session.created_at.timestamp_millis())
        .bind(session.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("insert session: {e}")))?;
        let stored = Self::fetch_session(&mut tx, &session.id).await?;
        commit(tx).await?;

        self.events.session(EventType::Created, &stored);
        Ok(stored)
    }

    async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get session: {e}")))?
            .ok_or_else(|| StoreError::session_not_found(id))?;
        Self::row_to_session(&row)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC, created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list sessions: {e}")))?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn list_child_sessions(&self, parent_id: &str) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE parent_id = ? ORDER BY created_at ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list child sessions: {e}")))?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn update_session(&self, session: Session) -> Result<Session, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "UPDATE sessions SET title = ?, summary_message_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&session.title)
        .bind(&session.summary_message_id)
        .bind(now().timestamp_millis())
        .bind(&session.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("update session: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::session_not_found(session.id));
        }
        let stored = Self::fetch_session(&mut tx, &session.id).await?;
        commit(tx).await?;

        self.events.session(EventType::Updated, &stored);
        Ok(stored)
    }

    async fn accumulate_usage(
        &self,
        id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Result<Session, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET input_tokens = input_tokens + ?,
                output_tokens = output_tokens + ?,
                cost = cost + ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(input_tokens as i64)
        .bind(output_tokens as i64)
        .bind(cost)
        .bind(now().timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("accumulate usage: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::session_not_found(id));
        }
        let stored = Self::fetch_session(&mut tx, id).await?;
        commit(tx).await?;

        self.events.session(EventType::Updated, &stored);
        Ok(stored)
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let root = Self::fetch_session(&mut tx, id).await?;

        let rows = sqlx::query(&format!(
            r#"
            WITH RECURSIVE tree(id, depth) AS (
                SELECT id, 0 FROM sessions WHERE id = ?
                UNION ALL
                SELECT s.id, t.depth + 1 FROM sessions s JOIN tree t ON s.parent_id = t.id
            )
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE id IN (SELECT id FROM tree)
            "#
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("collect session tree: {e}")))?;
        let mut doomed: Vec<Session> = rows
            .iter()
            .map(Self::row_to_session)
            .collect::<Result<_, _>>()?;
        // Children before parents.
        doomed.sort_by_key(|s| s.id == root.id);

        let mut removed_messages = Vec::new();
        for session in &doomed {
            let rows = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? ORDER BY seq ASC"
            ))
            .bind(&session.id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("collect messages: {e}")))?;
            for row in &rows {
                removed_messages.push(Self::row_to_message(row)?);
            }
            sqlx::query("DELETE FROM messages WHERE session_id = ?")
                .bind(&session.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(format!("delete messages: {e}")))?;
        }
        for session in &doomed {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(&session.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(format!("delete session: {e}")))?;
        }
        commit(tx).await?;

        for message in &removed_messages {
            self.events.message(EventType::Deleted, message);
        }
        for session in &doomed {
            self.events.session(EventType::Deleted, session);
        }
        Ok(())
    }

    async fn create_message(&self, message: Message) -> Result<Message, StoreError> {
        message.validate().map_err(StoreError::InvalidMessage)?;
        let parts = encode(&message)?;
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        Self::fetch_session(&mut tx, &message.session_id).await?;
        let finish = message.finish.as_ref();
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, parts, model, input_tokens, output_tokens,
                                  finish_reason, finish_detail, finished_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&parts)
        .bind(&message.model)
        .bind(message.input_tokens as i64)
        .bind(message.output_tokens as i64)
        .bind(finish.map(|f| f.reason.as_str()))
        .bind(finish.and_then(|f| f.detail.clone()))
        .bind(finish.map(|f| f.time.timestamp_millis()))
        .bind(message.created_at.timestamp_millis())
        .bind(message.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("insert message: {e}")))?;
        let session = Self::bump_message_count(&mut tx, &message.session_id, 1).await?;
        let stored = Self::fetch_message(&mut tx, &message.id).await?;
        commit(tx).await?;

        self.events.message(EventType::Created, &stored);
        self.events.session(EventType::Updated, &session);
        Ok(stored)
    }

    async fn get_message(&self, id: &str) -> Result<Message, StoreError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get message: {e}")))?
            .ok_or_else(|| StoreError::message_not_found(id))?;
        Self::row_to_message(&row)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? ORDER BY seq ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list messages: {e}")))?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn update_message(&self, message: Message) -> Result<Message, StoreError> {
        message.validate().map_err(StoreError::InvalidMessage)?;
        let parts = encode(&message)?;
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let current = Self::fetch_message(&mut tx, &message.id).await?;
        if current.is_finished() {
            return Err(StoreError::Immutable(message.id));
        }
        let finish = message.finish.as_ref();
        sqlx::query(
            r#"
            UPDATE messages
            SET parts = ?, model = ?, input_tokens = ?, output_tokens = ?,
                finish_reason = ?, finish_detail = ?, finished_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&parts)
        .bind(&message.model)
        .bind(message.input_tokens as i64)
        .bind(message.output_tokens as i64)
        .bind(finish.map(|f| f.reason.as_str()))
        .bind(finish.and_then(|f| f.detail.clone()))
        .bind(finish.map(|f| f.time.timestamp_millis()))
        .bind(now().timestamp_millis())
        .bind(&message.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("update message: {e}")))?;
        let stored = Self::fetch_message(&mut tx, &message.id).await?;
        commit(tx).await?;

        self.events.message(EventType::Updated, &stored);
        Ok(stored)
    }

    async fn delete_message(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let removed = Self::fetch_message(&mut tx, id).await?;
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("delete message: {e}")))?;
        let session = Self::bump_message_count(&mut tx, &removed.session_id, -1).await?;
        commit(tx).await?;

        self.events.message(EventType::Deleted, &removed);
        self.events.session(EventType::Updated, &session);
        Ok(())
    }

    async fn upsert_file(&self, snapshot: FileSnapshot) -> Result<FileSnapshot, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.begin().await?;
        let ts = now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO files (path, content, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.path)
        .bind(&snapshot.content)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("upsert file: {e}")))?;
        let row = sqlx::query("SELECT path, content, created_at, updated_at FROM files WHERE path = ?")
            .bind(&snapshot.path)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get file: {e}")))?;
        let stored = Self::row_to_file(&row)?;
        commit(tx).await?;
        Ok(stored)
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileSnapshot>, StoreError> {
        let row = sqlx::query("SELECT path, content, created_at, updated_at FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("get file: {e}")))?;
        row.as_ref().map(Self::row_to_file).transpose()
    }
}
