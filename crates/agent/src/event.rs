//! Orchestrator events.
//!
//! `AgentEvent` reports turn progress on its own broker, next to the store's
//! session and message brokers. The UI renders message content from the
//! store events and uses these for status lines and error banners.

use codeloom_core::event::EventType;
use serde::{Deserialize, Serialize};

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Preparing,
    Streaming,
    ToolDispatching,
    Done,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

/// Events emitted by the orchestrator.
///
/// - `state_changed`  : the turn moved to a new [`TurnState`]
/// - `tool_started`   : a tool call passed its checks and began running
/// - `tool_finished`  : a tool call produced its result
/// - `compacted`      : history was summarized and the anchor moved
/// - `title_generated`: a session received its generated title
/// - `turn_completed` : the turn reached `done`
/// - `turn_failed`    : the turn failed; the error is also on the message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StateChanged {
        session_id: String,
        state: TurnState,
    },

    ToolStarted {
        session_id: String,
        tool_call_id: String,
        name: String,
    },

    ToolFinished {
        session_id: String,
        tool_call_id: String,
        name: String,
        success: bool,
        duration_ms: u64,
    },

    Compacted {
        session_id: String,
        summary_message_id: String,
    },

    TitleGenerated {
        session_id: String,
        title: String,
    },

    TurnCompleted {
        session_id: String,
        message_id: String,
        iterations: u32,
    },

    TurnFailed {
        session_id: String,
        error: String,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::ToolStarted { session_id, .. }
            | Self::ToolFinished { session_id, .. }
            | Self::Compacted { session_id, .. }
            | Self::TitleGenerated { session_id, .. }
            | Self::TurnCompleted { session_id, .. }
            | Self::TurnFailed { session_id, .. } => session_id,
        }
    }

    /// Wire name, matching the serde tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolFinished { .. } => "tool_finished",
            Self::Compacted { .. } => "compacted",
            Self::TitleGenerated { .. } => "title_generated",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::TurnFailed { .. } => "turn_failed",
        }
    }

    /// Broker event kind: state transitions update, everything else is new.
    pub fn kind(&self) -> EventType {
        match self {
            Self::StateChanged { .. } => EventType::Updated,
            _ => EventType::Created,
        }
    }
}
