use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::IntoStaticStr;

use crate::types::claude::{ContentBlock, Message, StopReason, Usage};

/// Streaming event union, discriminated by the `type` field.
///
/// Payloads whose `type` is not one of the known variants are carried as
/// `Unknown` for lossy passthrough; that variant never round-trips through
/// serde and is handled by the SSE serializer directly.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: Message,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentBlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
    #[serde(skip)]
    Unknown {
        event: Option<String>,
        data: Value,
    },
}

impl StreamEvent {
    /// SSE `event:` field value for this event
    pub fn event_type(&self) -> Option<&str> {
        match self {
            StreamEvent::Unknown { event, .. } => event.as_deref(),
            other => Some(<&'static str>::from(other)),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, StreamEvent::Unknown { .. })
    }

    /// Synthetic message_delta carrying only a stop reason
    pub fn stopped(reason: StopReason, sequence: Option<String>) -> Self {
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(reason),
                stop_sequence: sequence,
            },
            usage: None,
        }
    }
}

/// Delta inside a content_block_delta event
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct MessageDeltaBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}
