//! Vendor-neutral history cleanup applied before translation.

use codeloom_core::message::{ContentPart, Message, Role};
use std::collections::HashSet;

pub(crate) const CANCELLED_RESULT: &str = "Tool call was cancelled before it produced a result";

/// Make every assistant tool call answered exactly once.
///
/// Vendors reject histories where a tool call has no result (calls dropped
/// by cancellation) or a result has no call (the call was compacted away).
/// Missing results get a synthetic failed result; orphaned results are
/// dropped; assistant messages with nothing to say are skipped.
pub(crate) fn pair_tool_results(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut open: Vec<(String, String)> = Vec::new();
    let mut answered: HashSet<String> = HashSet::new();

    let close = |out: &mut Vec<Message>, open: &mut Vec<(String, String)>, answered: &HashSet<String>, session: &str| {
        for (id, name) in open.drain(..) {
            if !answered.contains(&id) {
                out.push(Message::tool_result(session, id, name, CANCELLED_RESULT, false, None));
            }
        }
    };

    for message in messages {
        match message.role {
            Role::Tool => {
                let Some(id) = message.tool_result_id() else {
                    continue;
                };
                if open.iter().any(|(open_id, _)| open_id == id) && answered.insert(id.to_string()) {
                    out.push(message.clone());
                }
            }
            _ => {
                close(&mut out, &mut open, &answered, &message.session_id);
                answered.clear();
                if message.role == Role::Assistant && is_blank(message) {
                    continue;
                }
                if message.role == Role::Assistant {
                    open = message
                        .tool_calls()
                        .into_iter()
                        .map(|call| (call.id, call.name))
                        .collect();
                }
                out.push(message.clone());
            }
        }
    }
    if let Some(last) = messages.last() {
        close(&mut out, &mut open, &answered, &last.session_id);
    }
    out
}

fn is_blank(message: &Message) -> bool {
    message.parts.iter().all(|p| match p {
        ContentPart::Text { text } | ContentPart::Reasoning { text } => text.trim().is_empty(),
        _ => false,
    })
}

/// Arguments as a JSON object; malformed or empty input becomes `{}`.
pub(crate) fn tool_input(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => serde_json::json!({}),
    }
}
