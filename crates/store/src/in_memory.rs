//! In-memory store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use codeloom_core::error::StoreError;
use codeloom_core::event::EventType;
use codeloom_core::message::Message;
use codeloom_core::session::Session;
use codeloom_core::store::{FileSnapshot, Store};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{StoreEvents, now, truncate};

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    /// Insertion order is the chronological order.
    messages: Vec<Message>,
    files: HashMap<String, FileSnapshot>,
}

/// A store that keeps everything in process memory.
///
/// The `RwLock` write guard is the single writer; events are published while
/// it is held.
pub struct InMemoryStore {
    state: RwLock<State>,
    events: StoreEvents,
}

impl InMemoryStore {
    pub fn new(events: StoreEvents) -> Self {
        Self {
            state: RwLock::new(State::default()),
            events,
        }
    }

    pub fn events(&self) -> &StoreEvents {
        &self.events
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(StoreEvents::default())
    }
}

fn descendants(state: &State, root: &str) -> Vec<String> {
    let mut ids = vec![root.to_string()];
    let mut i = 0;
    while i < ids.len() {
        let parent = ids[i].clone();
        ids.extend(
            state
                .sessions
                .values()
                .filter(|s| s.parent_id.as_deref() == Some(parent.as_str()))
                .map(|s| s.id.clone()),
        );
        i += 1;
    }
    ids
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_session(&self, mut session: Session) -> Result<Session, StoreError> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::Storage(format!(
                "session {} already exists",
                session.id
            )));
        }
        if let Some(parent) = &session.parent_id
            && !state.sessions.contains_key(parent)
        {
            return Err(StoreError::session_not_found(parent.clone()));
        }
        session.created_at = truncate(session.created_at);
        session.updated_at = truncate(session.updated_at);
        state.sessions.insert(session.id.clone(), session.clone());
        self.events.session(EventType::Created, &session);
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let state = self.state.read().await;
        state
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::session_not_found(id))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn list_child_sessions(&self, parent_id: &str) -> Result<Vec<Session>, StoreError> {
        let state = self.state.read().await;
        let mut children: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn update_session(&self, session: Session) -> Result<Session, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::session_not_found(session.id.clone()))?;
        stored.title = session.title;
        stored.summary_message_id = session.summary_message_id;
        stored.updated_at = now();
        let updated = stored.clone();
        self.events.session(EventType::Updated, &updated);
        Ok(updated)
    }

    async fn accumulate_usage(
        &self,
        id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Result<Session, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::session_not_found(id))?;
        stored.input_tokens += input_tokens;
        stored.output_tokens += output_tokens;
        stored.cost += cost;
        stored.updated_at = now();
        let updated = stored.clone();
        self.events.session(EventType::Updated, &updated);
        Ok(updated)
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(id) {
            return Err(StoreError::session_not_found(id));
        }
        let doomed = descendants(&state, id);
        let (removed, kept): (Vec<Message>, Vec<Message>) = std::mem::take(&mut state.messages)
            .into_iter()
            .partition(|m| doomed.contains(&m.session_id));
        state.messages = kept;
        for message in &removed {
            self.events.message(EventType::Deleted, message);
        }
        for session_id in doomed.iter().rev() {
            if let Some(session) = state.sessions.remove(session_id) {
                self.events.session(EventType::Deleted, &session);
            }
        }
        Ok(())
    }

    async fn create_message(&self, mut message: Message) -> Result<Message, StoreError> {
        message.validate().map_err(StoreError::InvalidMessage)?;
        let mut state = self.state.write().await;
        if state.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Storage(format!(
                "message {} already exists",
                message.id
            )));
        }
        let session = state
            .sessions
            .get_mut(&message.session_id)
            .ok_or_else(|| StoreError::session_not_found(message.session_id.clone()))?;
        session.message_count += 1;
        session.updated_at = now();
        let session = session.clone();

        message.created_at = truncate(message.created_at);
        message.updated_at = truncate(message.updated_at);
        state.messages.push(message.clone());
        self.events.message(EventType::Created, &message);
        self.events.session(EventType::Updated, &session);
        Ok(message)
    }

    async fn get_message(&self, id: &str) -> Result<Message, StoreError> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::message_not_found(id))
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn update_message(&self, mut message: Message) -> Result<Message, StoreError> {
        message.validate().map_err(StoreError::InvalidMessage)?;
        let mut state = self.state.write().await;
        let stored = state
            .messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::message_not_found(message.id.clone()))?;
        if stored.is_finished() {
            return Err(StoreError::Immutable(message.id));
        }
        message.session_id = stored.session_id.clone();
        message.role = stored.role;
        message.created_at = stored.created_at;
        message.updated_at = now();
        *stored = message.clone();
        self.events.message(EventType::Updated, &message);
        Ok(message)
    }

    async fn delete_message(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let pos = state
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::message_not_found(id))?;
        let removed = state.messages.remove(pos);
        let session = state.sessions.get_mut(&removed.session_id).map(|s| {
            s.message_count = s.message_count.saturating_sub(1);
            s.updated_at = now();
            s.clone()
        });
        self.events.message(EventType::Deleted, &removed);
        if let Some(session) = session {
            self.events.session(EventType::Updated, &session);
        }
        Ok(())
    }

    async fn upsert_file(&self, snapshot: FileSnapshot) -> Result<FileSnapshot, StoreError> {
        let mut state = self.state.write().await;
        let ts = now();
        let entry = state
            .files
            .entry(snapshot.path.clone())
            .or_insert_with(|| FileSnapshot {
                created_at: ts,
                ..snapshot.clone()
            });
        entry.content = snapshot.content;
        entry.updated_at = ts;
        Ok(entry.clone())
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileSnapshot>, StoreError> {
        Ok(self.state.read().await.files.get(path).cloned())
    }
}
