//! Session domain type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversation between the user and the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    /// Set for sub-agent sessions spawned by the `agent` tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub message_count: u64,

    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    /// Accumulated spend in USD.
    #[serde(default)]
    pub cost: f64,

    /// Provider-visible history starts at this message when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_message_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), title)
    }

    pub fn with_id(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            message_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A child session owned by `parent`.
    pub fn child(id: impl Into<String>, parent: impl Into<String>, title: impl Into<String>) -> Self {
        let mut session = Self::with_id(id, title);
        session.parent_id = Some(parent.into());
        session
    }

    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}
