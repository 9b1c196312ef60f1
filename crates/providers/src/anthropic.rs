//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with typed `content_block_*` events
//! - Extended thinking for reasoning-capable models

use async_trait::async_trait;
use base64::Engine;
use codeloom_core::error::ProviderError;
use codeloom_core::message::{ContentPart, FinishReason, Message, Role};
use codeloom_core::provider::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::history::{pair_tool_results, tool_input};
use crate::http::{self, HttpSettings};
use crate::sse::{SseFrame, StreamDecoder, pump};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// Smallest completion budget worth splitting with a thinking budget.
const MIN_THINKING_MAX_TOKENS: u32 = 2_048;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    settings: HttpSettings,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, settings: HttpSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: http::client()?,
            settings,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert history to Anthropic messages.
    ///
    /// Tool results travel as `tool_result` blocks inside user messages, and
    /// consecutive messages of the same API role are merged because the API
    /// requires strict user/assistant alternation.
    fn to_api_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in pair_tool_results(messages) {
            let (role, blocks) = match msg.role {
                Role::User | Role::System => ("user", user_blocks(&msg)),
                Role::Assistant => ("assistant", assistant_blocks(&msg)),
                Role::Tool => ("user", tool_result_blocks(&msg)),
            };
            if blocks.is_empty() {
                continue;
            }
            match result.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => result.push(AnthropicMessage {
                    role: role.into(),
                    content: blocks,
                }),
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model.api_model,
            "messages": Self::to_api_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        if !request.system.is_empty() {
            body["system"] = serde_json::json!(request.system);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        if request.model.can_reason && request.max_tokens >= MIN_THINKING_MAX_TOKENS {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": request.max_tokens / 2,
            });
        }

        body
    }
}

fn user_blocks(msg: &Message) -> Vec<ContentBlock> {
    msg.parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(ContentBlock::Text { text: text.clone() })
            }
            ContentPart::ImageUrl { url, .. } => Some(ContentBlock::Image {
                source: match url.strip_prefix("data:").and_then(|rest| rest.split_once(";base64,")) {
                    Some((media_type, data)) => ImageSource::Base64 {
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    },
                    None => ImageSource::Url { url: url.clone() },
                },
            }),
            ContentPart::Binary { mime_type, data } if mime_type.starts_with("image/") => {
                Some(ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: mime_type.clone(),
                        data: base64::engine::general_purpose::STANDARD.encode(data),
                    },
                })
            }
            _ => None,
        })
        .collect()
}

fn assistant_blocks(msg: &Message) -> Vec<ContentBlock> {
    msg.parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(ContentBlock::Text { text: text.clone() })
            }
            ContentPart::ToolCall { id, name, input, .. } => Some(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: tool_input(input),
            }),
            // Thinking blocks cannot be replayed without their signature.
            _ => None,
        })
        .collect()
}

fn tool_result_blocks(msg: &Message) -> Vec<ContentBlock> {
    msg.parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                success,
                ..
            } => Some(ContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: content.clone(),
                is_error: !success,
            }),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl codeloom_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = "anthropic", model = %request.model.api_model, "Sending streaming request");

        let builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = http::send(builder, &self.settings, "anthropic").await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(
            response,
            AnthropicDecoder::default(),
            self.settings.idle_timeout,
            cancel,
            tx,
        ));
        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let builder = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        let response = http::send(builder, &self.settings, "anthropic").await?;

        let body: serde_json::Value = response.json().await.map_err(http::transport_error)?;
        Ok(body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Translates Anthropic's typed SSE events into provider events.
#[derive(Default)]
struct AnthropicDecoder {
    /// Content block index → tool-call ID, for open `tool_use` blocks
    tool_blocks: HashMap<u64, String>,
    saw_tool_use: bool,
    usage: Usage,
    stop_reason: Option<FinishReason>,
    finished: bool,
}

impl AnthropicDecoder {
    fn map_stop_reason(reason: &str) -> FinishReason {
        match reason {
            "tool_use" => FinishReason::ToolUse,
            "max_tokens" => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }

    fn error_event(error: &serde_json::Value) -> ProviderEvent {
        let message = error["message"].as_str().unwrap_or("unknown error").to_string();
        let err = match error["type"].as_str().unwrap_or("") {
            "overloaded_error" => ProviderError::ApiError {
                status_code: 529,
                message,
            },
            "rate_limit_error" => ProviderError::RateLimited { retry_after_secs: 5 },
            "api_error" => ProviderError::ApiError {
                status_code: 500,
                message,
            },
            "authentication_error" | "permission_error" => {
                ProviderError::AuthenticationFailed(message)
            }
            "not_found_error" => ProviderError::ModelNotFound(message),
            _ => ProviderError::ApiError {
                status_code: 400,
                message,
            },
        };
        ProviderEvent::error(err)
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn frame(&mut self, frame: &SseFrame) -> Vec<ProviderEvent> {
        if self.finished || frame.data.is_empty() {
            return Vec::new();
        }
        let event: serde_json::Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, data = %frame.data, "Ignoring unparseable Anthropic SSE");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                let usage = &event["message"]["usage"];
                self.usage.input_tokens = ["input_tokens", "cache_creation_input_tokens", "cache_read_input_tokens"]
                    .iter()
                    .filter_map(|k| usage[*k].as_u64())
                    .sum();
                if let Some(out_tokens) = usage["output_tokens"].as_u64() {
                    self.usage.output_tokens = out_tokens;
                }
            }
            "content_block_start" => {
                let index = event["index"].as_u64().unwrap_or(0);
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        self.tool_blocks.insert(index, id.clone());
                        self.saw_tool_use = true;
                        out.push(ProviderEvent::ToolCallStart { id, name });
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            out.push(ProviderEvent::ContentDelta(text.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = event["index"].as_u64().unwrap_or(0);
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(ProviderEvent::ContentDelta(text.to_string()));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) = delta["thinking"].as_str() {
                            out.push(ProviderEvent::ReasoningDelta(thinking.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(id), Some(partial)) =
                            (self.tool_blocks.get(&index), delta["partial_json"].as_str())
                            && !partial.is_empty()
                        {
                            out.push(ProviderEvent::ToolCallArgDelta {
                                id: id.clone(),
                                fragment: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = event["index"].as_u64().unwrap_or(0);
                if let Some(id) = self.tool_blocks.remove(&index) {
                    out.push(ProviderEvent::ToolCallEnd { id });
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(Self::map_stop_reason(reason));
                }
                if let Some(out_tokens) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = out_tokens;
                }
            }
            "message_stop" => {
                for (_, id) in self.tool_blocks.drain() {
                    out.push(ProviderEvent::ToolCallEnd { id });
                }
                let reason = match self.stop_reason {
                    Some(FinishReason::Stop) | None if self.saw_tool_use => FinishReason::ToolUse,
                    Some(reason) => reason,
                    None => FinishReason::Stop,
                };
                self.finished = true;
                out.push(ProviderEvent::Finish {
                    reason,
                    usage: self.usage,
                });
            }
            "error" => {
                self.finished = true;
                out.push(Self::error_event(&event["error"]));
            }
            _ => {}
        }
        out
    }

    fn end(&mut self) -> Vec<ProviderEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![ProviderEvent::error(ProviderError::StreamInterrupted(
            "stream ended before message_stop".into(),
        ))]
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}
