use std::sync::LazyLock;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::debug;

use crate::{
    claude_web::merge_messages,
    error::CloverError,
    pipeline::{PipelineContext, Processor, SharedCollected, names},
    stream::EventStream,
    types::{claude::Usage, streaming::StreamEvent},
};

static TOKENIZER: LazyLock<CoreBPE> =
    LazyLock::new(|| cl100k_base().expect("cl100k_base tokenizer"));

fn count_tokens(text: &str) -> u32 {
    TOKENIZER.encode_with_special_tokens(text).len() as u32
}

/// Estimates token usage when the upstream stream omits it.
///
/// Input tokens come from the merged prompt text; output tokens from the
/// collected message so far. Cache counters are reported as zero.
pub struct TokenCounterProcessor;

#[async_trait]
impl Processor for TokenCounterProcessor {
    fn name(&self) -> &'static str {
        names::TOKEN_COUNTER
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        let Some(events) = ctx.event_stream.take() else {
            return Ok(());
        };
        let (prompt, _) = merge_messages(&ctx.request.messages, ctx.request.system.as_ref())
            .await
            .unwrap_or_default();
        let input_tokens = count_tokens(&prompt);
        ctx.event_stream = Some(count_stream(events, input_tokens, ctx.collected.to_owned()));
        Ok(())
    }
}

fn count_stream(
    mut events: EventStream,
    input_tokens: u32,
    collected: SharedCollected,
) -> EventStream {
    Box::pin(try_stream! {
        while let Some(event) = events.next().await {
            let mut event = event?;
            match event {
                StreamEvent::MessageStart { ref mut message } => {
                    if message.usage.is_none() {
                        let usage = Usage::estimated(input_tokens, 1);
                        debug!("Estimated input tokens: {input_tokens}");
                        message.usage = Some(usage.to_owned());
                        if let Ok(mut collected) = collected.lock() {
                            collected.set_usage(usage);
                        }
                    }
                }
                StreamEvent::MessageDelta { ref mut usage, .. } => {
                    if usage.is_none() {
                        let output_tokens = output_tokens_of(&collected).await;
                        let estimated = Usage::estimated(input_tokens, output_tokens);
                        debug!(
                            "Estimated usage: input={input_tokens}, output={output_tokens}"
                        );
                        *usage = Some(estimated.to_owned());
                        if let Ok(mut collected) = collected.lock() {
                            collected.set_usage(estimated);
                        }
                    }
                }
                _ => {}
            }
            yield event;
        }
    })
}

async fn output_tokens_of(collected: &SharedCollected) -> u32 {
    let snapshot = collected.lock().ok().and_then(|c| c.snapshot());
    let Some(message) = snapshot else {
        return 0;
    };
    let Ok((text, _)) = merge_messages(&[message.to_input()], None).await else {
        return 0;
    };
    count_tokens(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::Collected,
        types::claude::{ContentBlock, Message},
        types::streaming::MessageDeltaBody,
    };
    use futures::stream;

    #[tokio::test]
    async fn missing_usage_is_estimated() {
        let collected = Collected::shared();
        {
            let mut guard = collected.lock().unwrap();
            let mut message = Message::skeleton("msg_01", "m");
            message.content = vec![ContentBlock::text("Hello world, this is output")];
            guard.on_message_start(&message);
        }
        let inputs: Vec<Result<StreamEvent, CloverError>> = vec![
            Ok(StreamEvent::MessageStart {
                message: Message::skeleton("msg_01", "m"),
            }),
            Ok(StreamEvent::MessageDelta {
                delta: MessageDeltaBody::default(),
                usage: None,
            }),
        ];
        let out: Vec<StreamEvent> = count_stream(
            Box::pin(stream::iter(inputs)),
            42,
            collected.to_owned(),
        )
        .map(|e| e.unwrap())
        .collect()
        .await;

        let StreamEvent::MessageStart { ref message } = out[0] else {
            panic!("expected message_start");
        };
        let usage = message.usage.as_ref().unwrap();
        assert_eq!(usage.input_tokens, 42);
        assert_eq!(usage.output_tokens, 1);
        assert_eq!(usage.cache_read_input_tokens, Some(0));

        let StreamEvent::MessageDelta { ref usage, .. } = out[1] else {
            panic!("expected message_delta");
        };
        let usage = usage.as_ref().unwrap();
        assert_eq!(usage.input_tokens, 42);
        assert!(usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn upstream_usage_is_preserved() {
        let collected = Collected::shared();
        let mut message = Message::skeleton("msg_01", "m");
        message.usage = Some(Usage {
            input_tokens: 7,
            output_tokens: 0,
            ..Default::default()
        });
        let inputs: Vec<Result<StreamEvent, CloverError>> =
            vec![Ok(StreamEvent::MessageStart { message })];
        let out: Vec<StreamEvent> =
            count_stream(Box::pin(stream::iter(inputs)), 42, collected)
                .map(|e| e.unwrap())
                .collect()
                .await;
        let StreamEvent::MessageStart { ref message } = out[0] else {
            panic!("expected message_start");
        };
        assert_eq!(message.usage.as_ref().unwrap().input_tokens, 7);
    }

    #[test]
    fn token_counts_are_nonzero_for_text() {
        assert!(count_tokens("Explain gravity in a sentence.") > 0);
        assert_eq!(count_tokens(""), 0);
    }
}
