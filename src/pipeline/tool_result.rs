use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    sse::EventSerializer,
    types::claude::{ContentBlock, Message, MessageContent, Role, ToolResultContent},
    types::streaming::StreamEvent,
};

/// Resumes a parked upstream stream when the client turns in a tool
/// result for a registered tool-use id.
///
/// The result is forwarded to the live conversation, a synthetic
/// message_start frame is prepended, and the upstream paths are skipped.
pub struct ToolResultProcessor;

fn pending_tool_result(ctx: &PipelineContext) -> Option<ContentBlock> {
    let last = ctx.request.messages.last()?;
    if last.role != Role::User {
        return None;
    }
    let MessageContent::Blocks(ref blocks) = last.content else {
        return None;
    };
    let block = blocks.last()?;
    matches!(block, ContentBlock::ToolResult { .. }).then(|| block.to_owned())
}

#[async_trait]
impl Processor for ToolResultProcessor {
    fn name(&self) -> &'static str {
        names::TOOL_RESULT
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        let Some(block) = pending_tool_result(ctx) else {
            return Ok(());
        };
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
            ..
        } = block
        else {
            return Ok(());
        };
        let Some(parked) = ctx.state.tool_calls.get(&tool_use_id) else {
            debug!("No pending tool call for {tool_use_id}");
            return Ok(());
        };
        let Some(session) = ctx.state.sessions.get(&parked.session_id).await else {
            warn!(
                "Session {} is gone for tool call {tool_use_id}",
                parked.session_id
            );
            ctx.state.tool_calls.complete(&tool_use_id);
            return Ok(());
        };
        // bare-string results are normalized to a text block list
        let content = match content {
            ToolResultContent::Text(text) => {
                ToolResultContent::Blocks(vec![ContentBlock::text(text)])
            }
            blocks => blocks,
        };
        let payload = json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error.unwrap_or_default(),
        });
        session.send_tool_result(&payload).await?;
        info!(
            "Forwarded tool result {tool_use_id} to session {}",
            session.session_id()
        );
        if !session.has_stream().await {
            warn!("No parked stream on session {}", session.session_id());
            ctx.state.tool_calls.complete(&tool_use_id);
            return Ok(());
        }

        // prepend a synthetic message_start so the resumed stream parses
        // as a fresh message
        let message = Message::skeleton(
            parked
                .message_id
                .to_owned()
                .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple())),
            ctx.request.model.to_owned(),
        );
        let frame = EventSerializer::new()
            .serialize_event(&StreamEvent::MessageStart { message })
            .ok_or(CloverError::UnexpectedNone {
                msg: "message_start frame failed to serialize",
            })?;
        let resumed = session.read_lines(ctx.state.sessions.to_owned());
        ctx.original_stream = Some(Box::pin(
            stream::iter([Ok::<_, CloverError>(frame)]).chain(resumed),
        ));
        ctx.session_id = Some(session.session_id().to_string());
        ctx.session = Some(session);
        ctx.state.tool_calls.complete(&tool_use_id);
        ctx.skip_processors.insert(names::CLAUDE_API);
        ctx.skip_processors.insert(names::CLAUDE_WEB);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::AppState, types::claude::CreateMessageParams, types::claude::InputMessage};

    fn tool_result_request(tool_use_id: &str) -> CreateMessageParams {
        CreateMessageParams {
            messages: vec![InputMessage::blocks(
                Role::User,
                vec![ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content: ToolResultContent::Text("42".to_string()),
                    is_error: None,
                    cache_control: None,
                }],
            )],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unregistered_tool_results_continue_the_pipeline() {
        let state = AppState::new_in_memory().await.unwrap();
        let mut ctx = PipelineContext::new(state, tool_result_request("toolu_unknown"), None);
        ToolResultProcessor.process(&mut ctx).await.unwrap();
        assert!(ctx.original_stream.is_none());
        assert!(ctx.skip_processors.is_empty());
    }

    #[tokio::test]
    async fn dead_session_completes_the_call() {
        let state = AppState::new_in_memory().await.unwrap();
        state
            .tool_calls
            .register("toolu_01".to_string(), "gone".to_string(), None);
        let mut ctx = PipelineContext::new(state, tool_result_request("toolu_01"), None);
        ToolResultProcessor.process(&mut ctx).await.unwrap();
        assert!(ctx.original_stream.is_none());
        assert!(ctx.state.tool_calls.get("toolu_01").is_none());
    }

    #[tokio::test]
    async fn plain_messages_are_ignored() {
        let state = AppState::new_in_memory().await.unwrap();
        let request = CreateMessageParams {
            messages: vec![InputMessage::text(Role::User, "hello")],
            ..Default::default()
        };
        let mut ctx = PipelineContext::new(state, request, None);
        ToolResultProcessor.process(&mut ctx).await.unwrap();
        assert!(ctx.original_stream.is_none());
    }
}
