use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::warn;

use crate::types::{
    claude::{ContentBlock, Message, ToolResultContent, Usage},
    streaming::{ContentBlockDelta, MessageDeltaBody},
};

pub type SharedCollected = Arc<Mutex<Collected>>;

/// Assistant message materialized incrementally from streaming events.
///
/// Blocks are tracked sparsely by index; tool-use input accumulates as
/// raw JSON fragments and is parsed leniently at block stop.
#[derive(Debug, Default)]
pub struct Collected {
    base: Option<Message>,
    blocks: Vec<Option<ContentBlock>>,
    partial_json: HashMap<usize, String>,
}

impl Collected {
    pub fn shared() -> SharedCollected {
        Arc::new(Mutex::new(Collected::default()))
    }

    pub fn on_message_start(&mut self, message: &Message) {
        self.blocks = message.content.iter().cloned().map(Some).collect();
        self.base = Some(message.to_owned());
        self.partial_json.clear();
    }

    pub fn on_block_start(&mut self, index: usize, block: &ContentBlock) {
        if self.base.is_none() {
            return;
        }
        while self.blocks.len() <= index {
            self.blocks.push(None);
        }
        self.blocks[index] = Some(block.to_owned());
    }

    pub fn on_delta(&mut self, index: usize, delta: &ContentBlockDelta) {
        if let ContentBlockDelta::InputJsonDelta { partial_json } = delta {
            let accumulates = matches!(
                self.blocks.get(index),
                Some(Some(
                    ContentBlock::ToolUse { .. }
                        | ContentBlock::ServerToolUse { .. }
                        | ContentBlock::ToolResult { .. }
                ))
            );
            if accumulates {
                self.partial_json
                    .entry(index)
                    .or_default()
                    .push_str(partial_json);
            }
            return;
        }
        let Some(Some(block)) = self.blocks.get_mut(index) else {
            return;
        };
        match (block, delta) {
            (ContentBlock::Text { text, .. }, ContentBlockDelta::TextDelta { text: d }) => {
                text.push_str(d);
            }
            (
                ContentBlock::Thinking { thinking, .. },
                ContentBlockDelta::ThinkingDelta { thinking: d },
            ) => {
                thinking.push_str(d);
            }
            (
                ContentBlock::Thinking { signature, .. },
                ContentBlockDelta::SignatureDelta { signature: d },
            ) => {
                *signature = Some(signature.take().unwrap_or_default() + d);
            }
            _ => {}
        }
    }

    /// Parse accumulated JSON fragments leniently; a parse failure drops
    /// the input and keeps the block
    pub fn on_block_stop(&mut self, index: usize) {
        let Some(raw) = self.partial_json.remove(&index) else {
            return;
        };
        let Some(Some(block)) = self.blocks.get_mut(index) else {
            return;
        };
        let parsed = json5::from_str::<serde_json::Value>(&raw)
            .inspect_err(|e| warn!("Lenient JSON parse failed for block {index}: {e}"))
            .ok();
        match block {
            ContentBlock::ToolUse { input, .. } | ContentBlock::ServerToolUse { input, .. } => {
                *input = parsed.unwrap_or(serde_json::json!({}));
            }
            ContentBlock::ToolResult { content, .. } => {
                if let Some(parsed) = parsed
                    && let Ok(blocks) = serde_json::from_value(parsed)
                {
                    *content = ToolResultContent::Blocks(blocks);
                }
            }
            _ => {}
        }
    }

    pub fn on_message_delta(&mut self, delta: &MessageDeltaBody, usage: Option<&Usage>) {
        let Some(ref mut base) = self.base else {
            return;
        };
        if let Some(reason) = delta.stop_reason {
            base.stop_reason = Some(reason);
        }
        if let Some(ref sequence) = delta.stop_sequence {
            base.stop_sequence = Some(sequence.to_owned());
        }
        if let Some(usage) = usage {
            base.usage = Some(usage.to_owned());
        }
    }

    pub fn set_usage(&mut self, usage: Usage) {
        if let Some(ref mut base) = self.base {
            base.usage = Some(usage);
        }
    }

    pub fn message_id(&self) -> Option<String> {
        self.base.as_ref().map(|m| m.id.to_owned())
    }

    pub fn has_usage(&self) -> bool {
        self.base.as_ref().is_some_and(|m| m.usage.is_some())
    }

    /// Current state of the message with index gaps compacted away
    pub fn snapshot(&self) -> Option<Message> {
        let mut message = self.base.to_owned()?;
        message.content = self.blocks.iter().flatten().cloned().collect();
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::claude::Role;
    use serde_json::json;

    fn started() -> Collected {
        let mut collected = Collected::default();
        collected.on_message_start(&Message::skeleton("msg_01", "claude-opus-4-20250514"));
        collected
    }

    #[test]
    fn text_deltas_accumulate() {
        let mut collected = started();
        collected.on_block_start(0, &ContentBlock::text(""));
        collected.on_delta(
            0,
            &ContentBlockDelta::TextDelta {
                text: "Hello ".to_string(),
            },
        );
        collected.on_delta(
            0,
            &ContentBlockDelta::TextDelta {
                text: "world".to_string(),
            },
        );
        let message = collected.snapshot().unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(
            message.content,
            vec![ContentBlock::text("Hello world")]
        );
    }

    #[test]
    fn lenient_tool_input_parses_at_block_stop() {
        let mut collected = started();
        collected.on_block_start(
            0,
            &ContentBlock::ToolUse {
                id: "toolu_01".to_string(),
                name: "search".to_string(),
                input: json!({}),
                cache_control: None,
            },
        );
        // single quotes and a trailing comma
        for fragment in ["{'query': ", "'rust',", "}"] {
            collected.on_delta(
                0,
                &ContentBlockDelta::InputJsonDelta {
                    partial_json: fragment.to_string(),
                },
            );
        }
        collected.on_block_stop(0);
        let message = collected.snapshot().unwrap();
        let ContentBlock::ToolUse { ref input, .. } = message.content[0] else {
            panic!("expected tool_use block");
        };
        assert_eq!(input, &json!({"query": "rust"}));
    }

    #[test]
    fn unparseable_input_keeps_the_block() {
        let mut collected = started();
        collected.on_block_start(
            0,
            &ContentBlock::ToolUse {
                id: "toolu_01".to_string(),
                name: "search".to_string(),
                input: json!({}),
                cache_control: None,
            },
        );
        collected.on_delta(
            0,
            &ContentBlockDelta::InputJsonDelta {
                partial_json: "{{{not json".to_string(),
            },
        );
        collected.on_block_stop(0);
        let message = collected.snapshot().unwrap();
        assert!(matches!(
            message.content[0],
            ContentBlock::ToolUse { ref input, .. } if input == &json!({})
        ));
    }

    #[test]
    fn message_delta_sets_stop_state() {
        let mut collected = started();
        collected.on_message_delta(
            &MessageDeltaBody {
                stop_reason: Some(crate::types::claude::StopReason::EndTurn),
                stop_sequence: None,
            },
            Some(&Usage::estimated(10, 20)),
        );
        let message = collected.snapshot().unwrap();
        assert_eq!(
            message.stop_reason,
            Some(crate::types::claude::StopReason::EndTurn)
        );
        assert_eq!(message.usage.unwrap().output_tokens, 20);
    }

    #[test]
    fn sparse_indexes_compact_in_snapshot() {
        let mut collected = started();
        collected.on_block_start(2, &ContentBlock::text("late"));
        let message = collected.snapshot().unwrap();
        assert_eq!(message.content.len(), 1);
    }

    #[test]
    fn snapshot_is_none_before_message_start() {
        let collected = Collected::default();
        assert!(collected.snapshot().is_none());
    }
}
