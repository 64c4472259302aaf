mod claude_api;
mod claude_web;
mod collected;
mod event_parsing;
mod message_collector;
mod model_injector;
mod responses;
mod stop_sequences;
mod test_message;
mod token_counter;
mod tool_call_event;
mod tool_result;

pub use claude_api::ClaudeApiProcessor;
pub use claude_web::ClaudeWebProcessor;
pub use collected::{Collected, SharedCollected};
pub use event_parsing::EventParsingProcessor;
pub use message_collector::MessageCollectorProcessor;
pub use model_injector::ModelInjectorProcessor;
pub use responses::{NonStreamingResponseProcessor, StreamingResponseProcessor};
pub use stop_sequences::StopSequencesProcessor;
pub use test_message::TestMessageProcessor;
pub use token_counter::TokenCounterProcessor;
pub use tool_call_event::ToolCallEventProcessor;
pub use tool_result::ToolResultProcessor;

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    claude_web::WebSession,
    error::CloverError,
    state::AppState,
    stream::{EventStream, LineStream},
    types::{claude::CreateMessageParams, web::WebRequestBody},
};

/// Per-request carrier threaded through the processors in order.
pub struct PipelineContext {
    pub state: AppState,
    pub request: CreateMessageParams,
    pub web_request: Option<WebRequestBody>,
    pub session: Option<WebSession>,
    pub original_stream: Option<LineStream>,
    pub event_stream: Option<EventStream>,
    pub collected: SharedCollected,
    pub response: Option<axum::response::Response>,
    pub stop_pipeline: bool,
    pub skip_processors: HashSet<&'static str>,
    pub session_id: Option<String>,
}

impl PipelineContext {
    pub fn new(state: AppState, request: CreateMessageParams, session_id: Option<String>) -> Self {
        Self {
            state,
            request,
            web_request: None,
            session: None,
            original_stream: None,
            event_stream: None,
            collected: Collected::shared(),
            response: None,
            stop_pipeline: false,
            skip_processors: HashSet::new(),
            session_id,
        }
    }
}

/// One transformation stage over the shared context.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError>;
}

/// Ordered, conditionally-skippable sequence of processors.
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// The canonical processing order for `/v1/messages`
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(TestMessageProcessor),
            Box::new(ToolResultProcessor),
            Box::new(ClaudeApiProcessor),
            Box::new(ClaudeWebProcessor),
            Box::new(EventParsingProcessor),
            Box::new(ModelInjectorProcessor),
            Box::new(StopSequencesProcessor),
            Box::new(ToolCallEventProcessor),
            Box::new(MessageCollectorProcessor),
            Box::new(TokenCounterProcessor),
            Box::new(StreamingResponseProcessor),
            Box::new(NonStreamingResponseProcessor),
        ])
    }

    /// Run processors in order; a failing stage force-evicts the web
    /// session before the error propagates.
    pub async fn run(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        for processor in &self.processors {
            if ctx.skip_processors.contains(processor.name()) {
                debug!("Skipping processor {}", processor.name());
                continue;
            }
            debug!("Running processor {}", processor.name());
            if let Err(e) = processor.process(ctx).await {
                if let Some(session) = ctx.session.take() {
                    ctx.state.sessions.remove(session.session_id()).await;
                }
                return Err(e);
            }
            if ctx.stop_pipeline {
                debug!("Pipeline stopped by {}", processor.name());
                break;
            }
        }
        Ok(())
    }
}

/// Processor names used in skip sets
pub mod names {
    pub const TEST_MESSAGE: &str = "test_message";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const CLAUDE_API: &str = "claude_api";
    pub const CLAUDE_WEB: &str = "claude_web";
    pub const EVENT_PARSING: &str = "event_parsing";
    pub const MODEL_INJECTOR: &str = "model_injector";
    pub const STOP_SEQUENCES: &str = "stop_sequences";
    pub const TOOL_CALL_EVENT: &str = "tool_call_event";
    pub const MESSAGE_COLLECTOR: &str = "message_collector";
    pub const TOKEN_COUNTER: &str = "token_counter";
    pub const STREAMING_RESPONSE: &str = "streaming_response";
    pub const NON_STREAMING_RESPONSE: &str = "non_streaming_response";
}
