//! Message assembler: folds a provider stream into one assistant message.
//!
//! The message is created in the store before the first event so the UI can
//! show it immediately. Text deltas are flushed at most once per flush
//! interval; structural changes (a tool call starting or ending) and the
//! terminal transition are flushed right away. Once a finish is recorded the
//! store refuses further updates.

use codeloom_core::error::{ProviderError, StoreError};
use codeloom_core::message::{ContentPart, Finish, FinishReason, Message};
use codeloom_core::provider::{ProviderEvent, Usage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::SessionManager;

/// How a stream ended.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    Finished { reason: FinishReason, usage: Usage },
    Cancelled,
    Failed(ProviderError),
}

/// The persisted, finished message and how its stream ended.
#[derive(Debug, Clone)]
pub struct Streamed {
    pub message: Message,
    pub end: StreamEnd,
}

enum Step {
    Delta,
    Structural,
    Terminal(StreamEnd),
}

pub struct MessageAssembler {
    sessions: SessionManager,
    message: Message,
    /// Catalog ID used to price usage
    model: String,
    flush_interval: Duration,
    last_flush: Instant,
    dirty: bool,
}

impl MessageAssembler {
    /// Persist an empty assistant message and start assembling into it.
    pub async fn begin(
        sessions: &SessionManager,
        session_id: &str,
        model: &str,
        flush_interval: Duration,
    ) -> Result<Self, StoreError> {
        let message = sessions
            .store()
            .create_message(Message::assistant(session_id, model))
            .await?;
        debug!(session_id = %session_id, message_id = %message.id, "Assistant message opened");
        Ok(Self {
            sessions: sessions.clone(),
            message,
            model: model.to_string(),
            flush_interval,
            last_flush: Instant::now(),
            dirty: false,
        })
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Consume `events` until a terminal event, channel close, or `cancel`.
    ///
    /// Store failures abort assembly; every other outcome leaves a finished
    /// message in the store.
    pub async fn consume(
        mut self,
        mut events: mpsc::Receiver<ProviderEvent>,
        cancel: &CancellationToken,
    ) -> Result<Streamed, StoreError> {
        loop {
            let deadline = self.last_flush + self.flush_interval;
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain(&mut events);
                    return self.close(StreamEnd::Cancelled).await;
                }
                _ = tokio::time::sleep_until(deadline), if self.dirty => {
                    self.flush().await?;
                    continue;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                let end = if cancel.is_cancelled() {
                    StreamEnd::Cancelled
                } else {
                    StreamEnd::Failed(ProviderError::StreamInterrupted(
                        "provider stream closed without a finish event".into(),
                    ))
                };
                return self.close(end).await;
            };

            match self.apply(event) {
                Step::Delta => {
                    if self.last_flush.elapsed() >= self.flush_interval {
                        self.flush().await?;
                    }
                }
                Step::Structural => self.flush().await?,
                Step::Terminal(end) => return self.close(end).await,
            }
        }
    }

    /// Fold in whatever content is already buffered, ignoring terminals.
    fn drain(&mut self, events: &mut mpsc::Receiver<ProviderEvent>) {
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                break;
            }
            self.apply(event);
        }
    }

    fn apply(&mut self, event: ProviderEvent) -> Step {
        match event {
            ProviderEvent::ContentDelta(delta) => {
                if !delta.is_empty() {
                    match self.message.parts.last_mut() {
                        Some(ContentPart::Text { text }) => text.push_str(&delta),
                        _ => self.message.parts.push(ContentPart::Text { text: delta }),
                    }
                    self.dirty = true;
                }
                Step::Delta
            }
            ProviderEvent::ReasoningDelta(delta) => {
                if !delta.is_empty() {
                    match self.message.parts.last_mut() {
                        Some(ContentPart::Reasoning { text }) => text.push_str(&delta),
                        _ => self.message.parts.push(ContentPart::Reasoning { text: delta }),
                    }
                    self.dirty = true;
                }
                Step::Delta
            }
            ProviderEvent::ToolCallStart { id, name } => {
                self.message.parts.push(ContentPart::ToolCall {
                    id,
                    name,
                    input: String::new(),
                    finished: false,
                });
                self.dirty = true;
                Step::Structural
            }
            ProviderEvent::ToolCallArgDelta { id, fragment } => {
                match self.tool_call(&id) {
                    Some((input, _)) => {
                        input.push_str(&fragment);
                        self.dirty = true;
                    }
                    None => warn!(tool_call_id = %id, "Argument delta for unknown tool call"),
                }
                Step::Delta
            }
            ProviderEvent::ToolCallEnd { id } => {
                match self.tool_call(&id) {
                    Some((_, finished)) => {
                        *finished = true;
                        self.dirty = true;
                    }
                    None => warn!(tool_call_id = %id, "End of unknown tool call"),
                }
                Step::Structural
            }
            ProviderEvent::Finish { reason, usage } => {
                Step::Terminal(StreamEnd::Finished { reason, usage })
            }
            ProviderEvent::Warning(message) => {
                warn!(message_id = %self.message.id, warning = %message, "Provider warning");
                Step::Delta
            }
            ProviderEvent::Error { error, .. } => Step::Terminal(StreamEnd::Failed(error)),
        }
    }

    fn tool_call(&mut self, call_id: &str) -> Option<(&mut String, &mut bool)> {
        self.message.parts.iter_mut().rev().find_map(|part| match part {
            ContentPart::ToolCall {
                id,
                input,
                finished,
                ..
            } if id.as_str() == call_id => Some((input, finished)),
            _ => None,
        })
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            self.message = self
                .sessions
                .store()
                .update_message(self.message.clone())
                .await?;
            self.dirty = false;
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    async fn close(mut self, end: StreamEnd) -> Result<Streamed, StoreError> {
        let (finish, usage) = match &end {
            StreamEnd::Finished { reason, usage } => (Finish::new(*reason), Some(*usage)),
            StreamEnd::Cancelled => (Finish::new(FinishReason::Cancelled), None),
            StreamEnd::Failed(error) => {
                (Finish::with_detail(FinishReason::Error, error.to_string()), None)
            }
        };

        for part in &mut self.message.parts {
            if let ContentPart::ToolCall { finished, .. } = part {
                *finished = true;
            }
        }
        if self.message.parts.is_empty() {
            self.message.parts.push(ContentPart::text(""));
        }
        if let Some(usage) = usage {
            self.message.input_tokens = usage.input_tokens;
            self.message.output_tokens = usage.output_tokens;
        }
        self.message.finish = Some(finish);

        let message = self.sessions.store().update_message(self.message).await?;
        if let Some(usage) = usage {
            self.sessions
                .accumulate_usage(
                    &message.session_id,
                    usage.input_tokens,
                    usage.output_tokens,
                    &self.model,
                )
                .await?;
        }
        debug!(
            message_id = %message.id,
            finish = ?message.finish_reason(),
            "Assistant message closed"
        );
        Ok(Streamed { message, end })
    }
}
