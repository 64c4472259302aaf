use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::warn;

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, SharedCollected, names},
    stream::EventStream,
    types::streaming::StreamEvent,
};

/// Passthrough stage that materializes the assistant message from the
/// events flowing by, without consuming the stream itself.
pub struct MessageCollectorProcessor;

#[async_trait]
impl Processor for MessageCollectorProcessor {
    fn name(&self) -> &'static str {
        names::MESSAGE_COLLECTOR
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        let Some(events) = ctx.event_stream.take() else {
            return Ok(());
        };
        ctx.event_stream = Some(collect_stream(events, ctx.collected.to_owned()));
        Ok(())
    }
}

fn collect_stream(mut events: EventStream, collected: SharedCollected) -> EventStream {
    Box::pin(try_stream! {
        while let Some(event) = events.next().await {
            let event = event?;
            if let Ok(mut collected) = collected.lock() {
                match &event {
                    StreamEvent::MessageStart { message } => {
                        collected.on_message_start(message);
                    }
                    StreamEvent::ContentBlockStart {
                        index,
                        content_block,
                    } => {
                        collected.on_block_start(*index, content_block);
                    }
                    StreamEvent::ContentBlockDelta { index, delta } => {
                        collected.on_delta(*index, delta);
                    }
                    StreamEvent::ContentBlockStop { index } => {
                        collected.on_block_stop(*index);
                    }
                    StreamEvent::MessageDelta { delta, usage } => {
                        collected.on_message_delta(delta, usage.as_ref());
                    }
                    StreamEvent::Error { error } => {
                        warn!("Error event in stream: {}", error.message);
                    }
                    _ => {}
                }
            }
            yield event;
        }
    })
}
