//! Provider trait: the abstraction over LLM vendors.
//!
//! Every vendor client turns a [`ProviderRequest`] into a stream of
//! normalized [`ProviderEvent`]s delivered over a bounded channel.
//!
//! Stream ordering: for one tool-call ID, `ToolCallStart` precedes its
//! `ToolCallArgDelta`s, which precede `ToolCallEnd`. `Finish` is sent at
//! most once and nothing follows it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::{FinishReason, Message};
use crate::model::ModelInfo;

/// One model call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Catalog entry of the model to call
    pub model: ModelInfo,

    /// System prompt for the agent role
    pub system: String,

    /// Provider-visible history, oldest first
    pub messages: Vec<Message>,

    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,

    /// Maximum tokens to generate
    pub max_tokens: u32,
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage reported by the provider for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// A normalized element of a provider stream.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgDelta { id: String, fragment: String },
    ToolCallEnd { id: String },
    Finish { reason: FinishReason, usage: Usage },
    Warning(String),
    Error { error: ProviderError, retryable: bool },
}

impl ProviderEvent {
    /// Wrap an error, classifying it with [`ProviderError::is_retryable`].
    pub fn error(error: ProviderError) -> Self {
        let retryable = error.is_retryable();
        Self::Error { error, retryable }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

/// The core Provider trait.
///
/// One implementation per vendor; the provider adapter picks the right one
/// by looking the model up in the catalog.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic", "openai").
    fn name(&self) -> &str;

    /// Open a streaming call.
    ///
    /// Errors returned here happen before any event was produced and may be
    /// retried by the caller. Failures after the stream opened arrive as
    /// [`ProviderEvent::Error`]. Implementations stop producing events once
    /// `cancel` fires.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError>;

    /// List model IDs the vendor reports as available.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }
}
