use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

use crate::{
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    sse::EventSerializer,
    types::streaming::StreamEvent,
};

/// Serializes the event stream back into SSE framing for streaming
/// clients.
pub struct StreamingResponseProcessor;

#[async_trait]
impl Processor for StreamingResponseProcessor {
    fn name(&self) -> &'static str {
        names::STREAMING_RESPONSE
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        if ctx.response.is_some() || !ctx.request.is_streaming() {
            return Ok(());
        }
        let Some(events) = ctx.event_stream.take() else {
            return Ok(());
        };
        info!("Streaming response to client");
        let frames = EventSerializer::new()
            .serialize_stream(events)
            .map(|frame| frame.map(Bytes::from));
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(frames))?;
        ctx.response = Some(response);
        Ok(())
    }
}

/// Drains the event stream and emits the collected message as buffered
/// JSON for non-streaming clients.
pub struct NonStreamingResponseProcessor;

#[async_trait]
impl Processor for NonStreamingResponseProcessor {
    fn name(&self) -> &'static str {
        names::NON_STREAMING_RESPONSE
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        if ctx.response.is_some() || ctx.request.is_streaming() {
            return Ok(());
        }
        let Some(mut events) = ctx.event_stream.take() else {
            return Ok(());
        };
        info!("Building non-streaming response");
        while let Some(event) = events.next().await {
            if let StreamEvent::Error { error } = event? {
                return Err(CloverError::ClaudeStreaming {
                    error_type: error.type_,
                    message: error.message,
                });
            }
        }
        let message = ctx
            .collected
            .lock()
            .ok()
            .and_then(|collected| collected.snapshot())
            .ok_or(CloverError::NoMessage)?;
        let mut response = Json(message).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, "no-cache".parse()?);
        ctx.response = Some(response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::MessageCollectorProcessor,
        state::AppState,
        types::claude::{ContentBlock, CreateMessageParams, Message},
        types::streaming::StreamError,
    };
    use futures::stream;
    use http_body_util::BodyExt;

    async fn ctx_with_events(
        stream_flag: bool,
        events: Vec<StreamEvent>,
    ) -> PipelineContext {
        let state = AppState::new_in_memory().await.unwrap();
        let request = CreateMessageParams {
            stream: Some(stream_flag),
            ..Default::default()
        };
        let mut ctx = PipelineContext::new(state, request, None);
        let events: Vec<Result<StreamEvent, CloverError>> =
            events.into_iter().map(Ok).collect();
        ctx.event_stream = Some(Box::pin(stream::iter(events)));
        ctx
    }

    fn sample_events() -> Vec<StreamEvent> {
        let mut message = Message::skeleton("msg_01", "m");
        message.content = vec![];
        vec![
            StreamEvent::MessageStart { message },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::text("done"),
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]
    }

    #[tokio::test]
    async fn streaming_response_carries_sse_headers() {
        let mut ctx = ctx_with_events(true, sample_events()).await;
        StreamingResponseProcessor.process(&mut ctx).await.unwrap();
        let response = ctx.response.take().unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("X-Accel-Buffering").unwrap(), "no");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: message_start\n"));
        assert!(text.ends_with("data: {\"type\":\"message_stop\"}\n\n"));
    }

    #[tokio::test]
    async fn non_streaming_drains_into_collected_json() {
        let mut ctx = ctx_with_events(false, sample_events()).await;
        // wire the collector in front, as the pipeline order does
        MessageCollectorProcessor.process(&mut ctx).await.unwrap();
        NonStreamingResponseProcessor
            .process(&mut ctx)
            .await
            .unwrap();
        let response = ctx.response.take().unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let message: Message = serde_json::from_slice(&body).unwrap();
        assert_eq!(message.id, "msg_01");
        assert_eq!(message.content, vec![ContentBlock::text("done")]);
    }

    #[tokio::test]
    async fn error_event_raises_streaming_error() {
        let mut ctx = ctx_with_events(
            false,
            vec![StreamEvent::Error {
                error: StreamError {
                    type_: "overloaded_error".to_string(),
                    message: "try later".to_string(),
                },
            }],
        )
        .await;
        let err = NonStreamingResponseProcessor
            .process(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CloverError::ClaudeStreaming { .. }));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn empty_stream_raises_no_message() {
        let mut ctx = ctx_with_events(false, vec![]).await;
        let err = NonStreamingResponseProcessor
            .process(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CloverError::NoMessage));
    }
}
