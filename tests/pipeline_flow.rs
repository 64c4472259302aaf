use clover::{
    error::CloverError,
    pipeline::{
        EventParsingProcessor, MessageCollectorProcessor, ModelInjectorProcessor,
        NonStreamingResponseProcessor, Pipeline, PipelineContext, StopSequencesProcessor,
        StreamingResponseProcessor, TokenCounterProcessor,
    },
    sse::EventParser,
    state::AppState,
    types::claude::{CreateMessageParams, InputMessage, Role, StopReason},
    types::streaming::{ContentBlockDelta, StreamEvent},
};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;

fn frame(event: &str, data: serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

fn upstream_sse(deltas: &[&str], closing: bool) -> String {
    let mut out = frame(
        "message_start",
        serde_json::json!({
            "type": "message_start",
            "message": {
                "id": "msg_upstream",
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": "",
            },
        }),
    );
    out += &frame(
        "content_block_start",
        serde_json::json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        }),
    );
    for delta in deltas {
        out += &frame(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": delta},
            }),
        );
    }
    if closing {
        out += &frame(
            "content_block_stop",
            serde_json::json!({"type": "content_block_stop", "index": 0}),
        );
        out += &frame(
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
            }),
        );
        out += &frame("message_stop", serde_json::json!({"type": "message_stop"}));
    }
    out
}

fn stream_stages() -> Pipeline {
    Pipeline::new(vec![
        Box::new(EventParsingProcessor),
        Box::new(ModelInjectorProcessor),
        Box::new(StopSequencesProcessor),
        Box::new(MessageCollectorProcessor),
        Box::new(TokenCounterProcessor),
        Box::new(StreamingResponseProcessor),
        Box::new(NonStreamingResponseProcessor),
    ])
}

async fn ctx_with_upstream(request: CreateMessageParams, sse: String) -> PipelineContext {
    let state = AppState::new_in_memory().await.unwrap();
    let mut ctx = PipelineContext::new(state, request, None);
    let chunks: Vec<Result<String, CloverError>> = vec![Ok(sse)];
    ctx.original_stream = Some(Box::pin(stream::iter(chunks)));
    ctx
}

async fn events_of_body(body: axum::body::Body) -> Vec<StreamEvent> {
    let bytes = body.collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<Result<String, CloverError>> = vec![Ok(text)];
    EventParser::new()
        .parse_stream(Box::pin(stream::iter(lines)))
        .map(|e| e.unwrap())
        .collect()
        .await
}

fn collected_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn stop_sequence_interception_end_to_end() {
    let request = CreateMessageParams {
        model: "claude-opus-4-20250514".to_string(),
        messages: vec![InputMessage::text(Role::User, "say something")],
        stop_sequences: Some(vec!["END".to_string()]),
        stream: Some(true),
        ..Default::default()
    };
    let sse = upstream_sse(&["Hello thEND world"], true);
    let mut ctx = ctx_with_upstream(request, sse).await;
    stream_stages().run(&mut ctx).await.unwrap();

    let events = events_of_body(ctx.response.take().unwrap().into_body()).await;
    assert_eq!(collected_text(&events), "Hello th");

    // the stream ends with the synthetic stop triple
    let n = events.len();
    assert!(matches!(events[n - 3], StreamEvent::ContentBlockStop { .. }));
    assert!(matches!(
        events[n - 2],
        StreamEvent::MessageDelta { ref delta, .. }
            if delta.stop_reason == Some(StopReason::StopSequence)
                && delta.stop_sequence.as_deref() == Some("END")
    ));
    assert!(matches!(events[n - 1], StreamEvent::MessageStop));
}

#[tokio::test]
async fn streaming_passthrough_preserves_order_and_injects_model() {
    let request = CreateMessageParams {
        model: "claude-opus-4-20250514".to_string(),
        messages: vec![InputMessage::text(Role::User, "Explain gravity")],
        stream: Some(true),
        ..Default::default()
    };
    let sse = upstream_sse(&["Gravity ", "pulls."], true);
    let mut ctx = ctx_with_upstream(request, sse).await;
    stream_stages().run(&mut ctx).await.unwrap();

    let events = events_of_body(ctx.response.take().unwrap().into_body()).await;
    let StreamEvent::MessageStart { ref message } = events[0] else {
        panic!("first event must be message_start");
    };
    assert_eq!(message.model, "claude-opus-4-20250514");
    // upstream carried no usage, the counter injects an estimate
    let usage = message.usage.as_ref().expect("estimated usage");
    assert!(usage.input_tokens > 0);
    assert_eq!(collected_text(&events), "Gravity pulls.");
    assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    // the injected usage on the closing message_delta counts the output
    let delta_usage = events.iter().find_map(|e| match e {
        StreamEvent::MessageDelta {
            usage: Some(usage), ..
        } => Some(usage),
        _ => None,
    });
    assert!(delta_usage.unwrap().output_tokens > 0);
}

#[tokio::test]
async fn non_streaming_drain_builds_the_message() {
    let request = CreateMessageParams {
        model: "claude-opus-4-20250514".to_string(),
        messages: vec![InputMessage::text(Role::User, "Explain gravity")],
        stream: Some(false),
        ..Default::default()
    };
    let sse = upstream_sse(&["Gravity ", "pulls."], true);
    let mut ctx = ctx_with_upstream(request, sse).await;
    stream_stages().run(&mut ctx).await.unwrap();

    let response = ctx.response.take().unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let message: clover::types::claude::Message = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(message.id, "msg_upstream");
    assert_eq!(message.model, "claude-opus-4-20250514");
    assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(
        message.content,
        vec![clover::types::claude::ContentBlock::text("Gravity pulls.")]
    );
}

#[tokio::test]
async fn unknown_upstream_events_are_dropped_from_the_client_stream() {
    let request = CreateMessageParams {
        model: "m".to_string(),
        messages: vec![InputMessage::text(Role::User, "hi")],
        stream: Some(true),
        ..Default::default()
    };
    let mut sse = frame(
        "conversation_title",
        serde_json::json!({"type": "conversation_title", "title": "chat"}),
    );
    sse += &upstream_sse(&["ok"], true);
    let mut ctx = ctx_with_upstream(request, sse).await;
    stream_stages().run(&mut ctx).await.unwrap();

    let events = events_of_body(ctx.response.take().unwrap().into_body()).await;
    assert!(events.iter().all(|e| !e.is_unknown()));
    assert_eq!(collected_text(&events), "ok");
}
