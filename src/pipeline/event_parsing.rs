use async_trait::async_trait;
use tracing::warn;

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    sse::EventParser,
};

/// Wraps the raw upstream line stream in the SSE decoder.
pub struct EventParsingProcessor;

#[async_trait]
impl Processor for EventParsingProcessor {
    fn name(&self) -> &'static str {
        names::EVENT_PARSING
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        if ctx.event_stream.is_some() {
            return Ok(());
        }
        let Some(lines) = ctx.original_stream.take() else {
            if ctx.response.is_none() {
                warn!("No upstream stream to parse");
            }
            return Ok(());
        };
        ctx.event_stream = Some(EventParser::new().parse_stream(lines));
        Ok(())
    }
}
