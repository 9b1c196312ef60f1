//! Store implementations for codeloom.
//!
//! Both backends serialize mutations through one writer and publish the
//! resulting entity on [`StoreEvents`] before releasing it, so subscribers
//! observe events in commit order.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use codeloom_core::event::{Broker, EventType};
use codeloom_core::message::Message;
use codeloom_core::session::Session;

/// Brokers a store publishes to.
#[derive(Clone, Default)]
pub struct StoreEvents {
    pub sessions: Broker<Session>,
    pub messages: Broker<Message>,
}

impl StoreEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session(&self, kind: EventType, session: &Session) {
        self.sessions.publish(kind, session.clone());
    }

    pub(crate) fn message(&self, kind: EventType, message: &Message) {
        self.messages.publish(kind, message.clone());
    }
}

/// Current time truncated to the millisecond precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(ts.timestamp_millis())
}
