//! `codeloom sessions`: list, inspect and delete stored sessions.

use codeloom_core::message::{ContentPart, Message};
use codeloom_core::session::Session;

use crate::app::App;

pub async fn list(app: &App) -> anyhow::Result<()> {
    let sessions = app.orchestrator.sessions().list().await?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }
    for session in sessions.iter().filter(|s| s.parent_id.is_none()) {
        println!("{}", session_line(session));
    }
    Ok(())
}

pub async fn show(app: &App, id: &str) -> anyhow::Result<()> {
    let sessions = app.orchestrator.sessions();
    let session = sessions.get(id).await?;
    println!("{}", session_line(&session));
    for child in sessions.list_by_parent(id).await? {
        println!("  └ {}", session_line(&child));
    }
    println!();
    for message in sessions.messages(id).await? {
        println!("{}", render_message(&message));
    }
    Ok(())
}

pub async fn delete(app: &App, id: &str) -> anyhow::Result<()> {
    app.orchestrator.delete_session(id).await?;
    println!("Deleted session {id}");
    Ok(())
}

fn session_line(session: &Session) -> String {
    let title = if session.has_title() { session.title.as_str() } else { "(untitled)" };
    format!(
        "{}  {:<40}  {:>4} msgs  {:>8} tok  ${:.4}  {}",
        session.id,
        title,
        session.message_count,
        session.total_tokens(),
        session.cost,
        session.updated_at.format("%Y-%m-%d %H:%M")
    )
}

/// One block per message: role, then its parts.
pub fn render_message(message: &Message) -> String {
    let mut out = format!("[{}]", message.role.as_str());
    if let Some(finish) = &message.finish
        && finish.reason != codeloom_core::message::FinishReason::Stop
    {
        out.push_str(&format!(" ({})", finish.reason.as_str()));
    }
    for part in &message.parts {
        let line = match part {
            ContentPart::Text { text } if text.is_empty() => continue,
            ContentPart::Text { text } => text.clone(),
            ContentPart::Reasoning { text } => format!("(thinking) {text}"),
            ContentPart::ImageUrl { url, .. } => format!("(image) {url}"),
            ContentPart::Binary { mime_type, .. } => format!("(attachment {mime_type})"),
            ContentPart::ToolCall { name, input, .. } => format!("→ {name} {input}"),
            ContentPart::ToolResult { name, content, success, .. } => {
                let mark = if *success { "←" } else { "✗" };
                format!("{mark} {name}: {}", first_lines(content, 5))
            }
        };
        out.push('\n');
        out.push_str(&line);
    }
    out
}

fn first_lines(text: &str, n: usize) -> String {
    let mut lines: Vec<&str> = text.lines().take(n + 1).collect();
    if lines.len() > n {
        lines.truncate(n);
        lines.push("…");
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloom_core::message::{Finish, FinishReason};

    #[test]
    fn tool_output_is_clipped() {
        let message = Message::tool_result(
            "s1",
            "c1",
            "bash",
            "1\n2\n3\n4\n5\n6\n7",
            true,
            None,
        );
        let rendered = render_message(&message);
        assert!(rendered.starts_with("[tool]"));
        assert!(rendered.contains("← bash: 1\n2\n3\n4\n5\n…"));
        assert!(!rendered.contains('6'));
    }

    #[test]
    fn unusual_finishes_are_labelled() {
        let mut message = Message::assistant("s1", "m");
        message.parts.push(ContentPart::text("partial"));
        message.finish = Some(Finish::new(FinishReason::Cancelled));
        assert_eq!(render_message(&message), "[assistant] (cancelled)\npartial");

        message.finish = Some(Finish::new(FinishReason::Stop));
        assert_eq!(render_message(&message), "[assistant]\npartial");
    }
}
