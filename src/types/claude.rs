use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(super) fn default_max_tokens() -> u32 {
    8192
}

/// Parameters for creating a message, Anthropic Messages API shape
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct CreateMessageParams {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Input messages for the conversation
    pub messages: Vec<InputMessage>,
    /// Model to use
    #[serde(default)]
    pub model: String,
    /// System prompt, either a string or an array of text blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    /// Temperature for response generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Custom stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Thinking mode configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
    /// Top-k sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Top-p sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Tools that the model may use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// How the model should use tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Request metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl CreateMessageParams {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or_default()
    }
}

/// Thinking mode in a Messages API request
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Thinking {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

impl Thinking {
    pub fn is_enabled(&self) -> bool {
        self.r#type == "enabled"
    }
}

/// Role of a message sender
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
}

/// Message in a conversation
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InputMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl InputMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// Content of a message, either plain text or structured blocks
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Content block in a message
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    Image {
        source: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    ServerToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    WebSearchToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn cache_control(&self) -> Option<&Value> {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. }
            | ContentBlock::Thinking { cache_control, .. }
            | ContentBlock::ToolUse { cache_control, .. }
            | ContentBlock::ServerToolUse { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. }
            | ContentBlock::WebSearchToolResult { cache_control, .. } => cache_control.as_ref(),
        }
    }
}

/// Tool result content, a bare string or nested blocks
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Source of an image
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
    File { file_uuid: String },
}

/// Reason for stopping message generation
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    PauseTurn,
    Refusal,
}

/// Token usage statistics
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

impl Usage {
    pub fn estimated(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_creation_input_tokens: Some(0),
            cache_read_input_tokens: Some(0),
        }
    }
}

/// An assistant message, as returned by the Messages API
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    /// Empty assistant message skeleton for synthetic message_start events
    pub fn skeleton(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_: "message".to_string(),
            role: Role::Assistant,
            content: vec![],
            model: model.into(),
            stop_reason: None,
            stop_sequence: None,
            usage: None,
        }
    }

    /// Convert to an input message so the merge utility can flatten it
    pub fn to_input(&self) -> InputMessage {
        InputMessage {
            role: self.role,
            content: MessageContent::Blocks(self.content.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_discriminator_round_trip() {
        let raw = json!({
            "type": "tool_use",
            "id": "toolu_01",
            "name": "get_weather",
            "input": {"city": "Paris"},
        });
        let block: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(block, ContentBlock::ToolUse { ref id, .. } if id == "toolu_01"));
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);
    }

    #[test]
    fn message_content_accepts_string_and_blocks() {
        let m: InputMessage = serde_json::from_value(json!({
            "role": "user",
            "content": "Hi"
        }))
        .unwrap();
        assert_eq!(m.content, MessageContent::Text("Hi".to_string()));

        let m: InputMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "Hi"}]
        }))
        .unwrap();
        assert!(matches!(m.content, MessageContent::Blocks(ref b) if b.len() == 1));
    }

    #[test]
    fn cache_control_is_preserved() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "text",
            "text": "prefix",
            "cache_control": {"type": "ephemeral"},
        }))
        .unwrap();
        assert!(block.cache_control().is_some());
    }

    #[test]
    fn message_excludes_null_fields() {
        let message = Message::skeleton("msg_test", "claude-opus-4-20250514");
        let v = serde_json::to_value(&message).unwrap();
        assert!(v.get("stop_reason").is_none());
        assert!(v.get("usage").is_none());
    }
}
