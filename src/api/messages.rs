use axum::{Json, extract::State, response::Response};
use colored::Colorize;
use tracing::{info, warn};

use crate::{
    config::CLOVER_CONFIG,
    error::CloverError,
    pipeline::{Pipeline, PipelineContext},
    state::AppState,
    types::claude::CreateMessageParams,
    utils::enabled,
};

/// `POST /v1/messages`: run the pipeline, retrying retryable failures
/// with a fresh context each attempt.
pub async fn api_messages(
    State(state): State<AppState>,
    Json(params): Json<CreateMessageParams>,
) -> Result<Response, CloverError> {
    info!(
        "[REQ] stream: {}, msgs: {}, model: {}, think: {}",
        enabled(params.is_streaming()),
        params.messages.len().to_string().green(),
        params.model.green(),
        enabled(params.thinking.is_some()),
    );
    let stopwatch = chrono::Utc::now();
    let (attempts, interval) = {
        let config = CLOVER_CONFIG.load();
        (config.retry_attempts.max(1), config.retry_interval)
    };
    let mut result = run_pipeline(&state, &params).await;
    for attempt in 1..attempts {
        match result {
            Err(ref e) if e.retryable() => {
                warn!(
                    "[RETRY] attempt {}: {e}",
                    (attempt + 1).to_string().green()
                );
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
                result = run_pipeline(&state, &params).await;
            }
            _ => break,
        }
    }
    let elapsed = chrono::Utc::now().signed_duration_since(stopwatch);
    info!(
        "[FIN] elapsed: {}s",
        format!("{}", elapsed.num_milliseconds() as f64 / 1000.0).green()
    );
    result
}

async fn run_pipeline(
    state: &AppState,
    params: &CreateMessageParams,
) -> Result<Response, CloverError> {
    let mut ctx = PipelineContext::new(state.to_owned(), params.to_owned(), None);
    Pipeline::standard().run(&mut ctx).await?;
    ctx.response.take().ok_or(CloverError::NoResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::claude::{InputMessage, Message, Role};
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn health_probe_round_trips_the_full_pipeline() {
        let state = AppState::new_in_memory().await.unwrap();
        let params = CreateMessageParams {
            model: "claude-opus-4-20250514".to_string(),
            messages: vec![InputMessage::text(Role::User, "Hi")],
            stream: Some(false),
            ..Default::default()
        };
        let response = api_messages(State(state), Json(params)).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let message: Message = serde_json::from_slice(&body).unwrap();
        assert_eq!(message.model, "claude-opus-4-20250514");
        assert_eq!(
            message.content,
            vec![crate::types::claude::ContentBlock::text(
                "Hello! How can I assist you today?"
            )]
        );
        assert_eq!(
            message.stop_reason,
            Some(crate::types::claude::StopReason::EndTurn)
        );
        let usage = message.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (1, 9));
    }

    #[tokio::test]
    async fn empty_pool_yields_no_accounts_available() {
        let state = AppState::new_in_memory().await.unwrap();
        let params = CreateMessageParams {
            model: "claude-opus-4-20250514".to_string(),
            messages: vec![InputMessage::text(Role::User, "Explain gravity")],
            stream: Some(false),
            ..Default::default()
        };
        let err = api_messages(State(state), Json(params)).await.unwrap_err();
        assert!(matches!(err, CloverError::NoAccountsAvailable));
    }
}
