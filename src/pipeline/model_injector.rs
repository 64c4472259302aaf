use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    types::streaming::StreamEvent,
};

/// Fills in `message.model` on message_start when the upstream omits it.
pub struct ModelInjectorProcessor;

#[async_trait]
impl Processor for ModelInjectorProcessor {
    fn name(&self) -> &'static str {
        names::MODEL_INJECTOR
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        let Some(mut events) = ctx.event_stream.take() else {
            return Ok(());
        };
        let model = ctx.request.model.to_owned();
        ctx.event_stream = Some(Box::pin(try_stream! {
            while let Some(event) = events.next().await {
                let mut event = event?;
                if let StreamEvent::MessageStart { ref mut message } = event
                    && message.model.is_empty()
                {
                    debug!("Injecting model {model} into message_start");
                    message.model = model.to_owned();
                }
                yield event;
            }
        }));
        Ok(())
    }
}
