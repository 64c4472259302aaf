use async_trait::async_trait;
use axum::{Json, response::IntoResponse};
use uuid::Uuid;

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    types::claude::{ContentBlock, Message, MessageContent, Role, StopReason, Usage},
};

/// Health-check hook: a single non-streaming user "Hi" gets a canned
/// answer so client probes never consume an account.
pub struct TestMessageProcessor;

fn is_test_message(ctx: &PipelineContext) -> bool {
    if ctx.request.is_streaming() || ctx.request.messages.len() != 1 {
        return false;
    }
    let message = &ctx.request.messages[0];
    if message.role != Role::User {
        return false;
    }
    match &message.content {
        MessageContent::Text(text) => text == "Hi",
        MessageContent::Blocks(blocks) => {
            matches!(blocks.as_slice(), [ContentBlock::Text { text, .. }] if text == "Hi")
        }
    }
}

#[async_trait]
impl Processor for TestMessageProcessor {
    fn name(&self) -> &'static str {
        names::TEST_MESSAGE
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        if !is_test_message(ctx) {
            return Ok(());
        }
        let mut message = Message::skeleton(
            format!("msg_{}", Uuid::new_v4().simple()),
            ctx.request.model.to_owned(),
        );
        message.content = vec![ContentBlock::text("Hello! How can I assist you today?")];
        message.stop_reason = Some(StopReason::EndTurn);
        message.usage = Some(Usage {
            input_tokens: 1,
            output_tokens: 9,
            ..Default::default()
        });
        ctx.response = Some(Json(message).into_response());
        ctx.stop_pipeline = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::AppState, types::claude::CreateMessageParams, types::claude::InputMessage};

    async fn ctx_for(request: CreateMessageParams) -> PipelineContext {
        let state = AppState::new_in_memory().await.unwrap();
        PipelineContext::new(state, request, None)
    }

    #[tokio::test]
    async fn plain_hi_yields_canned_response() {
        let request = CreateMessageParams {
            model: "claude-opus-4-20250514".to_string(),
            messages: vec![InputMessage::text(Role::User, "Hi")],
            stream: Some(false),
            ..Default::default()
        };
        let mut ctx = ctx_for(request).await;
        TestMessageProcessor.process(&mut ctx).await.unwrap();
        assert!(ctx.stop_pipeline);
        assert!(ctx.response.is_some());
    }

    #[tokio::test]
    async fn streaming_hi_is_not_a_probe() {
        let request = CreateMessageParams {
            messages: vec![InputMessage::text(Role::User, "Hi")],
            stream: Some(true),
            ..Default::default()
        };
        let mut ctx = ctx_for(request).await;
        TestMessageProcessor.process(&mut ctx).await.unwrap();
        assert!(!ctx.stop_pipeline);
        assert!(ctx.response.is_none());
    }

    #[tokio::test]
    async fn block_form_hi_is_a_probe() {
        let request = CreateMessageParams {
            messages: vec![InputMessage::blocks(
                Role::User,
                vec![ContentBlock::text("Hi")],
            )],
            stream: Some(false),
            ..Default::default()
        };
        let mut ctx = ctx_for(request).await;
        TestMessageProcessor.process(&mut ctx).await.unwrap();
        assert!(ctx.stop_pipeline);
    }

    #[tokio::test]
    async fn other_messages_pass_through() {
        let request = CreateMessageParams {
            messages: vec![InputMessage::text(Role::User, "Explain gravity")],
            stream: Some(false),
            ..Default::default()
        };
        let mut ctx = ctx_for(request).await;
        TestMessageProcessor.process(&mut ctx).await.unwrap();
        assert!(!ctx.stop_pipeline);
    }
}
