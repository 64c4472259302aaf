use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, SharedCollected, names},
    services::ToolCallRegistry,
    stream::EventStream,
    types::{claude::ContentBlock, claude::StopReason, streaming::StreamEvent},
};

/// Pauses the stream at a finished tool_use block.
///
/// The tool-use id is registered so a later client turn can resume the
/// parked upstream stream; synthetic message_delta/message_stop events
/// close the client's view. Upstream `tool_result` blocks are
/// suppressed, the client already supplied them.
pub struct ToolCallEventProcessor;

#[async_trait]
impl Processor for ToolCallEventProcessor {
    fn name(&self) -> &'static str {
        names::TOOL_CALL_EVENT
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        let Some(session) = ctx.session.as_ref() else {
            return Ok(());
        };
        let Some(events) = ctx.event_stream.take() else {
            return Ok(());
        };
        ctx.event_stream = Some(tool_event_stream(
            events,
            session.session_id().to_string(),
            ctx.state.tool_calls.to_owned(),
            ctx.collected.to_owned(),
        ));
        Ok(())
    }
}

fn tool_event_stream(
    mut events: EventStream,
    session_id: String,
    registry: ToolCallRegistry,
    collected: SharedCollected,
) -> EventStream {
    Box::pin(try_stream! {
        let mut pending_tool: Option<(String, usize)> = None;
        let mut suppressing_result = false;

        while let Some(event) = events.next().await {
            let event = event?;
            if let StreamEvent::ContentBlockStart {
                index,
                ref content_block,
            } = event
            {
                match content_block {
                    ContentBlock::ToolUse { id, .. } => {
                        debug!("Tool use started: {id} at index {index}");
                        pending_tool = Some((id.to_owned(), index));
                    }
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        debug!("Suppressing upstream tool result {tool_use_id}");
                        suppressing_result = true;
                    }
                    _ => {}
                }
            }
            let stopped_index = match event {
                StreamEvent::ContentBlockStop { index } => Some(index),
                _ => None,
            };
            if !suppressing_result {
                yield event;
            }
            if let Some(index) = stopped_index {
                if suppressing_result {
                    suppressing_result = false;
                    continue;
                }
                let Some((ref tool_use_id, tool_index)) = pending_tool else {
                    continue;
                };
                if index != tool_index {
                    continue;
                }
                info!("Tool use block ended: {tool_use_id}, pausing stream");
                // register before emitting so a slow consumer cannot
                // lose the parked id
                let message_id = collected.lock().ok().and_then(|c| c.message_id());
                registry.register(tool_use_id.to_owned(), session_id, message_id);
                yield StreamEvent::stopped(StopReason::ToolUse, None);
                yield StreamEvent::MessageStop;
                // break without draining: the upstream stream stays
                // parked in the session for resumption
                return;
            }
        }
    })
}
