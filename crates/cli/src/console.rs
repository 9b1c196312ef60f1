//! Terminal rendering of store and orchestrator events.

use codeloom_agent::{AgentEvent, TurnState};
use codeloom_core::message::{Message, Role};
use codeloom_security::permission::{PermissionDecision, PermissionRequest};
use std::collections::HashMap;

/// Tracks how much of each streaming message was already printed.
#[derive(Default)]
pub struct Console {
    printed: HashMap<String, usize>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of `message` not printed yet. Only assistant messages of
    /// `session_id` are rendered.
    pub fn text_delta(&mut self, session_id: &str, message: &Message) -> Option<String> {
        if message.session_id != session_id || message.role != Role::Assistant {
            return None;
        }
        let text = message.text();
        let seen = self.printed.entry(message.id.clone()).or_default();
        if text.len() <= *seen || !text.is_char_boundary(*seen) {
            return None;
        }
        let delta = text[*seen..].to_string();
        *seen = text.len();
        Some(delta)
    }

    pub fn reset(&mut self) {
        self.printed.clear();
    }
}

/// One status line for an orchestrator event, if it deserves one.
pub fn status_line(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::ToolStarted { name, .. } => Some(format!("  ⚙ {name}")),
        AgentEvent::ToolFinished {
            name,
            success: false,
            ..
        } => Some(format!("  ✗ {name} failed")),
        AgentEvent::Compacted { .. } => Some("  (conversation summarized)".into()),
        AgentEvent::StateChanged {
            state: TurnState::Cancelled,
            ..
        } => Some("  [cancelled]".into()),
        AgentEvent::TurnFailed { error, .. } => Some(format!("  [error] {error}")),
        _ => None,
    }
}

/// The question shown for a permission request.
pub fn permission_prompt(request: &PermissionRequest) -> String {
    let mut prompt = format!("\n  Allow {}? {}", request.tool_name, request.description);
    if let Some(path) = &request.path {
        prompt.push_str(&format!("\n  Path: {path}"));
    }
    prompt.push_str("\n  [y]es / [a]lways for this session / [N]o > ");
    prompt
}

/// Parse an answer to [`permission_prompt`]. Anything unrecognized denies.
pub fn parse_decision(answer: &str) -> PermissionDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PermissionDecision::AllowOnce,
        "a" | "always" => PermissionDecision::AllowForSession,
        _ => PermissionDecision::Deny,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloom_core::message::ContentPart;

    fn assistant(session: &str, text: &str) -> Message {
        let mut m = Message::assistant(session, "m");
        m.parts.push(ContentPart::text(text));
        m
    }

    #[test]
    fn deltas_only_print_new_text() {
        let mut console = Console::new();
        let mut message = assistant("s1", "Hel");
        assert_eq!(console.text_delta("s1", &message).as_deref(), Some("Hel"));
        assert_eq!(console.text_delta("s1", &message), None);

        message.parts = vec![ContentPart::text("Hello")];
        assert_eq!(console.text_delta("s1", &message).as_deref(), Some("lo"));
    }

    #[test]
    fn other_sessions_and_roles_are_ignored() {
        let mut console = Console::new();
        assert_eq!(console.text_delta("s1", &assistant("child", "hi")), None);
        assert_eq!(console.text_delta("s1", &Message::user("s1", "hi")), None);
    }

    #[test]
    fn decisions() {
        assert_eq!(parse_decision("y"), PermissionDecision::AllowOnce);
        assert_eq!(parse_decision(" Always\n"), PermissionDecision::AllowForSession);
        assert_eq!(parse_decision(""), PermissionDecision::Deny);
        assert_eq!(parse_decision("sure"), PermissionDecision::Deny);
    }

    #[test]
    fn status_lines() {
        let failed = AgentEvent::ToolFinished {
            session_id: "s".into(),
            tool_call_id: "c".into(),
            name: "bash".into(),
            success: false,
            duration_ms: 3,
        };
        assert_eq!(status_line(&failed).as_deref(), Some("  ✗ bash failed"));
        let ok = AgentEvent::ToolFinished {
            session_id: "s".into(),
            tool_call_id: "c".into(),
            name: "bash".into(),
            success: true,
            duration_ms: 3,
        };
        assert_eq!(status_line(&ok), None);
    }

    #[test]
    fn prompt_mentions_path() {
        let request = PermissionRequest {
            id: "r1".into(),
            session_id: "s1".into(),
            tool_name: "write".into(),
            description: "Create src/lib.rs".into(),
            params: serde_json::json!({}),
            path: Some("src/lib.rs".into()),
        };
        let prompt = permission_prompt(&request);
        assert!(prompt.contains("Allow write?"));
        assert!(prompt.contains("Path: src/lib.rs"));
    }
}
