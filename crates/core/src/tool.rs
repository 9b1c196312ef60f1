//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the workspace:
//! read and edit files, run shell commands, search, fetch URLs.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as the raw JSON string produced by the model
    pub input: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input: input.into(),
        }
    }

    /// Decode the arguments into a typed parameter struct.
    pub fn parse_input<P: DeserializeOwned>(&self) -> Result<P, ToolError> {
        let raw = if self.input.trim().is_empty() { "{}" } else { &self.input };
        serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

/// What the model sees after a tool ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The text body sent back to the model
    pub content: String,

    /// Optional structured data for the UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// End the turn once sibling calls finish.
    #[serde(default)]
    pub stop: bool,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            metadata: None,
            stop: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            metadata: None,
            stop: false,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Ask the orchestrator to end the turn after this dispatch round.
    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }
}

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,

    /// The assistant message that requested the call
    pub message_id: String,

    /// Fires when the owning turn is cancelled
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            cancel,
        }
    }
}

/// The core Tool trait.
///
/// Implementations must be safe to run concurrently with themselves.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "bash", "view").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Read-only tools run without asking the user.
    fn side_effect_free(&self) -> bool {
        false
    }

    /// Whether this particular call must pass the permission gate.
    fn requires_permission(&self, _input: &serde_json::Value) -> bool {
        !self.side_effect_free()
    }

    /// One-line summary shown in the permission prompt.
    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("{} {}", self.name(), input)
    }

    /// Path the call touches, when there is one.
    fn permission_path(&self, input: &serde_json::Value) -> Option<String> {
        input
            .get("file_path")
            .or_else(|| input.get("path"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Execute the tool. Failures the model should see are returned as an
    /// unsuccessful [`ToolResponse`] or as a [`ToolError`].
    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// An ordered set of tools addressable by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&slot) => self.tools[slot] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    /// A registry holding only the named tools that exist here.
    pub fn subset(&self, names: &[&str]) -> Self {
        let mut out = Self::new();
        for tool in &self.tools {
            if names.contains(&tool.name()) {
                out.register(Arc::clone(tool));
            }
        }
        out
    }

    /// Get all tool definitions (for sending to the LLM), in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
