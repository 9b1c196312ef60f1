//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, Groq, OpenRouter, Ollama, vLLM and any endpoint that
//! exposes `/chat/completions` with SSE streaming and function calling.

use async_trait::async_trait;
use base64::Engine;
use codeloom_core::error::ProviderError;
use codeloom_core::message::{ContentPart, FinishReason, Message, Role};
use codeloom_core::provider::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::history::pair_tool_results;
use crate::http::{self, HttpSettings};
use crate::sse::{SseFrame, StreamDecoder, pump};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    settings: HttpSettings,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        settings: HttpSettings,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http::client()?,
            settings,
        })
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>, settings: HttpSettings) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", api_key, settings)
    }

    /// Convert history to OpenAI chat messages, system prompt first.
    fn to_api_messages(system: &str, messages: &[Message]) -> Vec<ApiMessage> {
        let mut result = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            result.push(ApiMessage::text("system", system));
        }

        for m in pair_tool_results(messages) {
            match m.role {
                Role::System => result.push(ApiMessage::text("system", m.text())),
                Role::User => result.push(ApiMessage {
                    role: "user".into(),
                    content: Some(user_content(&m)),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                Role::Assistant => {
                    let calls: Vec<ApiToolCall> = m
                        .tool_calls()
                        .into_iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id,
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name,
                                arguments: if tc.input.trim().is_empty() {
                                    "{}".into()
                                } else {
                                    tc.input
                                },
                            },
                        })
                        .collect();
                    let text = m.text();
                    result.push(ApiMessage {
                        role: "assistant".into(),
                        content: (!text.is_empty()).then(|| ApiContent::Text(text)),
                        tool_calls: (!calls.is_empty()).then_some(calls),
                        tool_call_id: None,
                    });
                }
                Role::Tool => {
                    for part in &m.parts {
                        if let ContentPart::ToolResult {
                            tool_call_id,
                            content,
                            ..
                        } = part
                        {
                            result.push(ApiMessage {
                                role: "tool".into(),
                                content: Some(ApiContent::Text(content.clone())),
                                tool_calls: None,
                                tool_call_id: Some(tool_call_id.clone()),
                            });
                        }
                    }
                }
            }
        }
        result
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model.api_model,
            "messages": Self::to_api_messages(&request.system, &request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        // Reasoning models reject `max_tokens`.
        if request.model.can_reason {
            body["max_completion_tokens"] = serde_json::json!(request.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }
}

fn user_content(m: &Message) -> ApiContent {
    let has_media = m
        .parts
        .iter()
        .any(|p| matches!(p, ContentPart::ImageUrl { .. } | ContentPart::Binary { .. }));
    if !has_media {
        return ApiContent::Text(m.text());
    }
    ApiContent::Parts(
        m.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(ApiContentPart::Text { text: text.clone() }),
                ContentPart::ImageUrl { url, .. } => Some(ApiContentPart::ImageUrl {
                    image_url: ApiImageUrl { url: url.clone() },
                }),
                ContentPart::Binary { mime_type, data } if mime_type.starts_with("image/") => {
                    Some(ApiContentPart::ImageUrl {
                        image_url: ApiImageUrl {
                            url: format!(
                                "data:{mime_type};base64,{}",
                                base64::engine::general_purpose::STANDARD.encode(data)
                            ),
                        },
                    })
                }
                _ => None,
            })
            .collect(),
    )
}

#[async_trait]
impl codeloom_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = %self.name, model = %request.model.api_model, "Sending streaming request");

        let builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = http::send(builder, &self.settings, &self.name).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(
            response,
            OpenAiDecoder::default(),
            self.settings.idle_timeout,
            cancel,
            tx,
        ));
        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let builder = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        let response = http::send(builder, &self.settings, &self.name).await?;

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

/// Turns chat-completion chunks into provider events.
///
/// Tool calls arrive keyed by index; the ID and name come with the first
/// fragment. The finish reason arrives before the usage-only chunk, so
/// `Finish` is held back until usage or `[DONE]`.
#[derive(Default)]
struct OpenAiDecoder {
    /// index → tool-call ID, for calls not yet ended
    open_calls: BTreeMap<u32, String>,
    saw_tool_calls: bool,
    pending_finish: Option<FinishReason>,
    usage: Usage,
    finished: bool,
}

impl OpenAiDecoder {
    fn map_finish_reason(reason: &str) -> FinishReason {
        match reason {
            "tool_calls" | "function_call" => FinishReason::ToolUse,
            "length" => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }

    fn close_calls(&mut self, out: &mut Vec<ProviderEvent>) {
        for (_, id) in std::mem::take(&mut self.open_calls) {
            out.push(ProviderEvent::ToolCallEnd { id });
        }
    }

    fn finish(&mut self, out: &mut Vec<ProviderEvent>) {
        self.close_calls(out);
        let reason = match self.pending_finish {
            Some(FinishReason::Stop) | None if self.saw_tool_calls => FinishReason::ToolUse,
            Some(reason) => reason,
            None => FinishReason::Stop,
        };
        self.finished = true;
        out.push(ProviderEvent::Finish {
            reason,
            usage: self.usage,
        });
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn frame(&mut self, frame: &SseFrame) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let data = frame.data.trim();
        if data == "[DONE]" {
            if self.pending_finish.is_some() || self.saw_tool_calls {
                self.finish(&mut out);
            } else {
                self.finished = true;
                out.push(ProviderEvent::error(ProviderError::StreamInterrupted(
                    "stream completed without a finish reason".into(),
                )));
            }
            return out;
        }

        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                return out;
            }
        };

        if let Some(error) = chunk.error {
            self.finished = true;
            out.push(ProviderEvent::error(ProviderError::ApiError {
                status_code: error
                    .code
                    .as_ref()
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(500),
                message: error.message,
            }));
            return out;
        }

        for choice in &chunk.choices {
            let delta = &choice.delta;
            if let Some(reasoning) = delta.reasoning_content.as_ref().filter(|r| !r.is_empty()) {
                out.push(ProviderEvent::ReasoningDelta(reasoning.clone()));
            }
            if let Some(content) = delta.content.as_ref().filter(|c| !c.is_empty()) {
                out.push(ProviderEvent::ContentDelta(content.clone()));
            }
            for tc in delta.tool_calls.iter().flatten() {
                let function = tc.function.as_ref();
                if !self.open_calls.contains_key(&tc.index) {
                    let id = tc
                        .id
                        .clone()
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    let name = function.and_then(|f| f.name.clone()).unwrap_or_default();
                    self.open_calls.insert(tc.index, id.clone());
                    self.saw_tool_calls = true;
                    out.push(ProviderEvent::ToolCallStart { id, name });
                }
                if let Some(args) = function.and_then(|f| f.arguments.as_ref()).filter(|a| !a.is_empty())
                    && let Some(id) = self.open_calls.get(&tc.index)
                {
                    out.push(ProviderEvent::ToolCallArgDelta {
                        id: id.clone(),
                        fragment: args.clone(),
                    });
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.pending_finish = Some(Self::map_finish_reason(reason));
                self.close_calls(&mut out);
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = Usage::new(usage.prompt_tokens, usage.completion_tokens);
            if self.pending_finish.is_some() {
                self.finish(&mut out);
            }
        }
        out
    }

    fn end(&mut self) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        if self.pending_finish.is_some() {
            self.finish(&mut out);
        } else {
            self.finished = true;
            out.push(ProviderEvent::error(ProviderError::StreamInterrupted(
                "stream ended without a finish reason".into(),
            )));
        }
        out
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(ApiContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiContentPart>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentPart {
    Text { text: String },
    ImageUrl { image_url: ApiImageUrl },
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
    /// Numeric status on some gateways, a string code on others
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    /// Emitted by DeepSeek-style reasoning endpoints
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::serve_once;
    use codeloom_core::Provider;
    use codeloom_core::model::ModelInfo;

    fn decode(chunks: &[&str]) -> Vec<ProviderEvent> {
        let mut decoder = OpenAiDecoder::default();
        let mut events: Vec<ProviderEvent> = chunks
            .iter()
            .flat_map(|c| {
                decoder.frame(&SseFrame {
                    event: None,
                    data: c.to_string(),
                })
            })
            .collect();
        events.extend(decoder.end());
        events
    }

    fn request(model: ModelInfo) -> ProviderRequest {
        ProviderRequest {
            model,
            system: "Be brief.".into(),
            messages: vec![Message::user("s1", "Hello")],
            tools: vec![],
            max_tokens: 256,
        }
    }

    #[test]
    fn message_conversion() {
        let api = OpenAiCompatProvider::to_api_messages("You are helpful", &[Message::user("s1", "Hello")]);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
    }

    #[test]
    fn message_conversion_with_tool_calls() {
        let mut msg = Message::assistant("s1", "gpt-4o");
        msg.parts.push(ContentPart::ToolCall {
            id: "call_1".into(),
            name: "bash".into(),
            input: r#"{"command":"ls"}"#.into(),
            finished: true,
        });
        let history = vec![
            Message::user("s1", "list"),
            msg,
            Message::tool_result("s1", "call_1", "bash", "Cargo.toml", true, None),
        ];
        let api = OpenAiCompatProvider::to_api_messages("", &history);
        assert_eq!(api.len(), 3);
        let tc = api[1].tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].function.name, "bash");
        assert!(api[1].content.is_none());
        assert_eq!(api[2].role, "tool");
        assert_eq!(api[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn images_use_content_parts() {
        let mut msg = Message::user("s1", "describe");
        msg.parts.push(ContentPart::Binary {
            mime_type: "image/png".into(),
            data: vec![1, 2, 3],
        });
        let api = OpenAiCompatProvider::to_api_messages("", &[msg]);
        let json = serde_json::to_value(&api[0]).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert!(
            json["content"][1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "grep".into(),
            description: "Search files".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let api_tools = OpenAiCompatProvider::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].function.name, "grep");
        assert_eq!(api_tools[0].r#type, "function");
    }

    #[test]
    fn reasoning_models_use_max_completion_tokens() {
        let mut model = ModelInfo::new("o3-mini", "openai", 200_000);
        model.can_reason = true;
        let body = OpenAiCompatProvider::request_body(&request(model));
        assert_eq!(body["max_completion_tokens"], 256);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn text_stream_waits_for_usage() {
        let events = decode(&[
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            "[DONE]",
        ]);
        assert_eq!(events.len(), 3);
        match &events[2] {
            ProviderEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                assert_eq!(*usage, Usage::new(10, 5));
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn parallel_tool_calls_stream_in_order() {
        let events = decode(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"view","arguments":""}},{"index":1,"id":"call_b","function":{"name":"ls","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"file_path\":\"/a\"}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"{}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);
        let kinds: Vec<String> = events
            .iter()
            .map(|e| match e {
                ProviderEvent::ToolCallStart { id, .. } => format!("start:{id}"),
                ProviderEvent::ToolCallArgDelta { id, .. } => format!("arg:{id}"),
                ProviderEvent::ToolCallEnd { id } => format!("end:{id}"),
                ProviderEvent::Finish { reason, .. } => format!("finish:{reason}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(
            kinds,
            [
                "start:call_a",
                "start:call_b",
                "arg:call_a",
                "arg:call_b",
                "end:call_a",
                "end:call_b",
                "finish:tool_use"
            ]
        );
    }

    #[test]
    fn missing_finish_is_an_error() {
        let events = decode(&[r#"{"choices":[{"delta":{"content":"cut"},"finish_reason":null}]}"#]);
        assert!(matches!(events.last(), Some(ProviderEvent::Error { retryable: true, .. })));
    }

    #[test]
    fn in_band_error_chunk() {
        let events = decode(&[r#"{"error":{"message":"upstream overloaded","code":503}}"#]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProviderEvent::Error { retryable: true, .. }));
    }

    #[tokio::test]
    async fn streams_over_http() {
        let body = [
            r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":1}}"#,
            "[DONE]",
        ]
        .iter()
        .map(|d| format!("data: {d}\n\n"))
        .collect::<String>();
        let (base, raw_request) = serve_once(200, "text/event-stream", body).await;

        let provider = OpenAiCompatProvider::new("openai", base, "sk-test", HttpSettings::default()).unwrap();
        let mut model = ModelInfo::new("gpt-4o", "openai", 128_000);
        model.api_model = "gpt-4o-2024-08-06".into();
        let mut rx = provider.stream(request(model), CancellationToken::new()).await.unwrap();

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert!(matches!(&events[0], ProviderEvent::ContentDelta(t) if t == "Hi"));
        assert!(matches!(events[1], ProviderEvent::Finish { reason: FinishReason::Stop, usage } if usage == Usage::new(7, 1)));

        let raw = raw_request.await.unwrap();
        assert!(raw.starts_with("POST /chat/completions"));
        assert!(raw.contains("gpt-4o-2024-08-06"));
        assert!(raw.to_lowercase().contains("authorization: bearer sk-test"));
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let (base, _req) = serve_once(503, "text/plain", "unavailable".into()).await;
        let provider = OpenAiCompatProvider::new("openai", base, "sk", HttpSettings::default()).unwrap();
        let err = provider
            .stream(request(ModelInfo::new("gpt-4o", "openai", 128_000)), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
