//! Title and summary sub-agents: single provider calls with fixed prompts.

use codeloom_core::error::AgentError;
use codeloom_core::message::Message;
use codeloom_core::provider::{ProviderEvent, Usage};
use codeloom_providers::ProviderAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assembler::{MessageAssembler, StreamEnd, Streamed};
use crate::budget;
use crate::prompt;
use crate::session::SessionManager;

/// Completion budget for a title.
pub const TITLE_MAX_TOKENS: u32 = 80;

/// Longest title kept, in characters.
pub const TITLE_MAX_CHARS: usize = 50;

pub struct TitleGenerator {
    adapter: Arc<ProviderAdapter>,
    model: String,
}

impl TitleGenerator {
    pub fn new(adapter: Arc<ProviderAdapter>, model: impl Into<String>) -> Self {
        Self {
            adapter,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask for a title for a conversation opening with `first_message`.
    pub async fn generate(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        first_message: &str,
    ) -> Result<(String, Usage), AgentError> {
        let mut events = self
            .adapter
            .stream_with_limit(
                cancel,
                &self.model,
                prompt::TITLE.to_string(),
                vec![Message::user(session_id, first_message)],
                Vec::new(),
                Some(TITLE_MAX_TOKENS),
            )
            .await;

        let mut raw = String::new();
        while let Some(event) = events.recv().await {
            match event {
                ProviderEvent::ContentDelta(delta) => raw.push_str(&delta),
                ProviderEvent::Finish { usage, .. } => {
                    let title = clean_title(&raw);
                    debug!(session_id = %session_id, title = %title, "Title generated");
                    return Ok((title, usage));
                }
                ProviderEvent::Error { error, .. } => return Err(error.into()),
                _ => {}
            }
        }
        Err(AgentError::StreamEnded)
    }
}

/// First non-empty line, without quotes or colons, at most
/// [`TITLE_MAX_CHARS`] characters.
pub fn clean_title(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let stripped: String = line
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '`' | ':'))
        .collect();
    let words: Vec<&str> = stripped.split_whitespace().collect();
    let joined = words.join(" ");
    match joined.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => joined[..cut].trim_end().to_string(),
        None => joined,
    }
}

pub struct Summarizer {
    adapter: Arc<ProviderAdapter>,
    sessions: SessionManager,
    model: String,
    flush_interval: Duration,
}

impl Summarizer {
    pub fn new(
        adapter: Arc<ProviderAdapter>,
        sessions: SessionManager,
        model: impl Into<String>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            adapter,
            sessions,
            model: model.into(),
            flush_interval,
        }
    }

    /// Summarize `history` into a new assistant message of `session_id`.
    ///
    /// A finished summary becomes the session's summary anchor. Fails with
    /// [`AgentError::ContextOverflow`] when the request would exceed the
    /// summarizer model's window.
    pub async fn summarize(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        history: &[Message],
    ) -> Result<Streamed, AgentError> {
        let model = self
            .adapter
            .model(&self.model)
            .ok_or_else(|| AgentError::UnknownModel(self.model.clone()))?;
        let estimated = budget::estimate_prompt(prompt::SUMMARIZER, history, prompt::SUMMARY_REQUEST);
        if estimated > model.context_window {
            return Err(AgentError::ContextOverflow {
                estimated,
                window: model.context_window,
            });
        }

        info!(session_id = %session_id, messages = history.len(), estimated, "Summarizing session");
        let mut messages = history.to_vec();
        messages.push(Message::user(session_id, prompt::SUMMARY_REQUEST));

        let assembler =
            MessageAssembler::begin(&self.sessions, session_id, &self.model, self.flush_interval).await?;
        let events = self
            .adapter
            .stream(cancel, &self.model, prompt::SUMMARIZER.to_string(), messages, Vec::new())
            .await;
        let streamed = assembler.consume(events, cancel).await?;

        if let StreamEnd::Finished { .. } = streamed.end {
            self.sessions
                .set_summary_anchor(session_id, &streamed.message.id)
                .await?;
        }
        Ok(streamed)
    }
}
