//! Message and content-part domain types.
//!
//! A message is an ordered list of [`ContentPart`]s. Parts are stored as a
//! tagged JSON array (`{"type": "text", ...}`); unknown tags fail to decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Why a model call (or a whole turn) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the model's answer
    Stop,
    /// The model requested tool calls
    ToolUse,
    /// Output hit the token limit
    Length,
    /// The turn was cancelled by the user
    Cancelled,
    /// Provider or storage failure
    Error,
    /// The tool loop ceiling was reached
    LoopLimit,
    /// The conversation no longer fits the model's context window
    ContextOverflow,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolUse => "tool_use",
            Self::Length => "length",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::LoopLimit => "loop_limit",
            Self::ContextOverflow => "context_overflow",
        }
    }
}

impl std::str::FromStr for FinishReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "tool_use" => Ok(Self::ToolUse),
            "length" => Ok(Self::Length),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            "loop_limit" => Ok(Self::LoopLimit),
            "context_overflow" => Ok(Self::ContextOverflow),
            other => Err(format!("unknown finish reason '{other}'")),
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal state recorded on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finish {
    pub reason: FinishReason,

    /// Human-readable detail, set for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub time: DateTime<Utc>,
}

impl Finish {
    pub fn new(reason: FinishReason) -> Self {
        Self {
            reason,
            detail: None,
            time: Utc::now(),
        }
    }

    pub fn with_detail(reason: FinishReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
            time: Utc::now(),
        }
    }
}

/// One element of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ImageUrl {
        url: String,
        mime_type: String,
    },
    Binary {
        mime_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ToolCall {
        id: String,
        name: String,
        /// Raw JSON argument string as streamed by the model.
        input: String,
        #[serde(default)]
        finished: bool,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Whether a message with `role` may carry this part.
    pub fn allowed_for(&self, role: Role) -> bool {
        match (role, self) {
            (Role::User, Self::Text { .. } | Self::ImageUrl { .. } | Self::Binary { .. }) => true,
            (Role::System, Self::Text { .. }) => true,
            (
                Role::Assistant,
                Self::Text { .. } | Self::Reasoning { .. } | Self::ToolCall { .. },
            ) => true,
            (Role::Tool, Self::ToolResult { .. }) => true,
            _ => false,
        }
    }

    /// Rough size in characters, used for token estimates.
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text { text } | Self::Reasoning { text } => text.len(),
            Self::ImageUrl { url, .. } => url.len(),
            // Attachments are billed per image by vendors, not per byte.
            Self::Binary { .. } => 1000,
            Self::ToolCall { name, input, .. } => name.len() + input.len(),
            Self::ToolResult { content, .. } => content.len(),
        }
    }
}

/// A tool call as it appears in an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallPart {
    pub id: String,
    pub name: String,
    pub input: String,
    pub finished: bool,
}

/// A single persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Owning session
    pub session_id: String,

    /// Who sent this message
    pub role: Role,

    /// Ordered body parts
    pub parts: Vec<ContentPart>,

    /// Model that produced an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Provider-reported prompt tokens for this call (assistant only)
    #[serde(default)]
    pub input_tokens: u64,

    /// Provider-reported completion tokens for this call (assistant only)
    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<Finish>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role, parts: Vec<ContentPart>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            parts,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            finish: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new user message.
    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, vec![ContentPart::text(text)])
    }

    /// Create an empty assistant message to be filled while streaming.
    pub fn assistant(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        let mut message = Self::new(session_id, Role::Assistant, Vec::new());
        message.model = Some(model.into());
        message
    }

    /// Create a tool message carrying exactly one result part.
    pub fn tool_result(
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        success: bool,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self::new(
            session_id,
            Role::Tool,
            vec![ContentPart::ToolResult {
                tool_call_id: tool_call_id.into(),
                name: name.into(),
                content: content.into(),
                success,
                metadata,
            }],
        )
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated reasoning parts.
    pub fn reasoning(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool calls in the order the model emitted them.
    pub fn tool_calls(&self) -> Vec<ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall {
                    id,
                    name,
                    input,
                    finished,
                } => Some(ToolCallPart {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    finished: *finished,
                }),
                _ => None,
            })
            .collect()
    }

    /// The tool-call ID answered by this message, for tool messages.
    pub fn tool_result_id(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            ContentPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish.as_ref().map(|f| f.reason)
    }

    /// Get a token count estimate (rough: 4 chars ≈ 1 token, rounded up).
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self.parts.iter().map(ContentPart::char_len).sum();
        chars.div_ceil(4) as u64
    }

    /// Check the role/part invariants.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(part) = self.parts.iter().find(|p| !p.allowed_for(self.role)) {
            return Err(format!(
                "{} message cannot carry a {} part",
                self.role.as_str(),
                part_tag(part)
            ));
        }
        if self.role == Role::Tool && self.parts.len() != 1 {
            return Err(format!(
                "tool message must carry exactly one result part, found {}",
                self.parts.len()
            ));
        }
        Ok(())
    }
}

fn part_tag(part: &ContentPart) -> &'static str {
    match part {
        ContentPart::Text { .. } => "text",
        ContentPart::Reasoning { .. } => "reasoning",
        ContentPart::ImageUrl { .. } => "image_url",
        ContentPart::Binary { .. } => "binary",
        ContentPart::ToolCall { .. } => "tool_call",
        ContentPart::ToolResult { .. } => "tool_result",
    }
}

/// Encode content parts as the persisted JSON array.
pub fn encode_parts(parts: &[ContentPart]) -> Result<String, serde_json::Error> {
    serde_json::to_string(parts)
}

/// Decode the persisted JSON array; unknown part tags are an error.
pub fn decode_parts(raw: &str) -> Result<Vec<ContentPart>, serde_json::Error> {
    serde_json::from_str(raw)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("s1", "Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(msg.tool_calls().is_empty());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn parts_use_tagged_encoding() {
        let parts = vec![
            ContentPart::text("hi"),
            ContentPart::ToolCall {
                id: "c1".into(),
                name: "ls".into(),
                input: r#"{"path":"/tmp"}"#.into(),
                finished: true,
            },
        ];
        let json = encode_parts(&parts).unwrap();
        assert!(json.contains(r#""type":"text""#));
        assert!(json.contains(r#""type":"tool_call""#));
        assert_eq!(decode_parts(&json).unwrap(), parts);
    }

    #[test]
    fn unknown_part_tag_is_rejected() {
        let err = decode_parts(r#"[{"type":"hologram","text":"x"}]"#).unwrap_err();
        assert!(err.to_string().contains("hologram"));
    }

    #[test]
    fn binary_part_is_base64() {
        let parts = vec![ContentPart::Binary {
            mime_type: "image/png".into(),
            data: vec![0, 159, 146, 150],
        }];
        let json = encode_parts(&parts).unwrap();
        assert!(json.contains("AJ+Slg=="));
        assert_eq!(decode_parts(&json).unwrap(), parts);
    }

    #[test]
    fn tool_message_with_text_is_invalid() {
        let mut msg = Message::tool_result("s1", "c1", "ls", "a\nb\n", true, None);
        assert!(msg.validate().is_ok());
        msg.parts.push(ContentPart::text("extra"));
        assert!(msg.validate().is_err());
    }

    #[test]
    fn user_message_cannot_carry_tool_calls() {
        let mut msg = Message::user("s1", "hi");
        msg.parts.push(ContentPart::ToolCall {
            id: "c1".into(),
            name: "bash".into(),
            input: "{}".into(),
            finished: true,
        });
        let err = msg.validate().unwrap_err();
        assert!(err.contains("tool_call"));
    }

    #[test]
    fn token_estimate_counts_all_parts() {
        let mut msg = Message::assistant("s1", "m");
        // 20 chars of text + 12 chars of tool call = 32 chars ≈ 8 tokens
        msg.parts.push(ContentPart::text("12345678901234567890"));
        msg.parts.push(ContentPart::ToolCall {
            id: "c".into(),
            name: "ls".into(),
            input: "0123456789".into(),
            finished: true,
        });
        assert_eq!(msg.estimated_tokens(), 8);

        msg.parts.push(ContentPart::text("x"));
        assert_eq!(msg.estimated_tokens(), 9);
    }

    #[test]
    fn finish_reason_round_trips_through_str() {
        for reason in [
            FinishReason::Stop,
            FinishReason::ToolUse,
            FinishReason::Length,
            FinishReason::Cancelled,
            FinishReason::Error,
            FinishReason::LoopLimit,
            FinishReason::ContextOverflow,
        ] {
            assert_eq!(reason.as_str().parse::<FinishReason>().unwrap(), reason);
        }
    }
}
