use async_trait::async_trait;
use axum::{body::Body, http::Response};
use serde_json::{Value, json};
use snafu::ResultExt;
use tracing::{debug, info, warn};
use wreq::{StatusCode, header};

use crate::{
    account::{Account, AccountFilter},
    claude_web::SUPER_CLIENT,
    config::{CLAUDE_CODE_PROMPT, CLOVER_CONFIG},
    error::{CloverError, WreqSnafu},
    pipeline::{PipelineContext, Processor, names},
    services::CacheScan,
    types::claude::CreateMessageParams,
};

/// Preferred path: the Anthropic Messages API with an OAuth bearer.
///
/// Prompt-cache stickiness routes repeat prefixes to the same account;
/// otherwise selection load-balances over token-carrying accounts. On
/// success the upstream body streams through untouched and the pipeline
/// stops. NoAccountsAvailable and InvalidModelName fall through to the
/// web path.
pub struct ClaudeApiProcessor;

#[async_trait]
impl Processor for ClaudeApiProcessor {
    fn name(&self) -> &'static str {
        names::CLAUDE_API
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        if ctx.response.is_some() {
            return Ok(());
        }
        let mut params = ctx.request.to_owned();
        inject_system(&mut params);

        let scan = ctx.state.prompt_cache.scan(&params);
        let account = match select_account(&ctx.state, &ctx.request.model, &scan).await {
            Ok(account) => account,
            Err(CloverError::NoAccountsAvailable) => {
                debug!("No OAuth accounts available, falling through to web path");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match send_api_request(&account, &params).await {
            Ok(response) => {
                ctx.state
                    .prompt_cache
                    .record(&scan.checkpoints, &account.organization_uuid);
                info!(
                    "Served via Messages API with account {}",
                    account.ellipse()
                );
                ctx.response = Some(response);
                ctx.stop_pipeline = true;
                Ok(())
            }
            Err(e) => {
                ctx.state.pool.report(&account.organization_uuid, &e).await;
                if let CloverError::InvalidModelName { ref model } = e {
                    warn!("Invalid model name {model}, falling through to web path");
                    return Ok(());
                }
                Err(e)
            }
        }
    }
}

/// Prepend the Claude Code system sentence unless it already leads
fn inject_system(params: &mut CreateMessageParams) {
    let prompt = CLOVER_CONFIG
        .load()
        .custom_prompt
        .to_owned()
        .unwrap_or_else(|| CLAUDE_CODE_PROMPT.to_string());
    let sentence = json!({ "type": "text", "text": prompt });
    params.system = Some(match params.system.take() {
        Some(Value::String(existing)) => {
            json!([sentence, { "type": "text", "text": existing }])
        }
        Some(Value::Array(blocks)) => {
            if blocks
                .first()
                .is_some_and(|b| b["text"].as_str() == Some(prompt.as_str()))
            {
                Value::Array(blocks)
            } else {
                let mut with_sentence = vec![sentence];
                with_sentence.extend(blocks);
                Value::Array(with_sentence)
            }
        }
        _ => json!([sentence]),
    });
}

/// Sticky account first, load balancing second
async fn select_account(
    state: &crate::state::AppState,
    model: &str,
    scan: &CacheScan,
) -> Result<Account, CloverError> {
    if let Some(ref org) = scan.sticky_account
        && let Some(account) = state.pool.acquire_by_id(org.to_owned()).await?
    {
        debug!("Prompt cache stickiness picked account {}", account.ellipse());
        return Ok(account);
    }
    let filter = if CLOVER_CONFIG.load().is_max_model(model) {
        AccountFilter::max_only()
    } else {
        AccountFilter::default()
    };
    state.pool.acquire_oauth(filter).await
}

async fn send_api_request(
    account: &Account,
    params: &CreateMessageParams,
) -> Result<Response<Body>, CloverError> {
    let token = account
        .oauth_token
        .as_ref()
        .ok_or(CloverError::UnexpectedNone {
            msg: "selected account carries no oauth token",
        })?;
    let url = format!(
        "{}v1/messages",
        CLOVER_CONFIG.load().claude_api_baseurl.as_str()
    );
    let res = SUPER_CLIENT
        .post(url)
        .bearer_auth(&token.access_token)
        .header("anthropic-beta", "oauth-2025-04-20")
        .header("anthropic-version", "2023-06-01")
        .json(params)
        .send()
        .await
        .context(WreqSnafu {
            msg: "Failed to send Messages API request",
        })?;
    let res = check_api_response(res, &params.model).await?;
    forward_response(res)
}

/// API-specific classification layered over the common one
async fn check_api_response(
    res: wreq::Response,
    model: &str,
) -> Result<wreq::Response, CloverError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let resets_at = res
            .headers()
            .get("anthropic-ratelimit-unified-reset")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<i64>().ok())
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(|| chrono::Utc::now() + chrono::Duration::hours(1));
        return Err(CloverError::ClaudeRateLimited { resets_at });
    }
    let text = res.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(json!({ "message": text }));
    let message = body
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .unwrap_or_default();
    if status == StatusCode::BAD_REQUEST && message == "system: Invalid model name" {
        return Err(CloverError::InvalidModelName {
            model: model.to_string(),
        });
    }
    if status == StatusCode::UNAUTHORIZED
        && message.contains("OAuth authentication is currently not allowed")
    {
        return Err(CloverError::OAuthNotAllowed);
    }
    Err(CloverError::ClaudeHttp { code: status, body })
}

/// Stream the upstream body through, dropping hop-encoding headers
fn forward_response(res: wreq::Response) -> Result<Response<Body>, CloverError> {
    let status = res.status();
    let upstream_headers = res.headers().to_owned();
    let stream = futures::StreamExt::map(res.bytes_stream(), |chunk| {
        chunk.map_err(|e| CloverError::Wreq {
            msg: "Upstream body read failed",
            source: e,
        })
    });
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (key, value) in upstream_headers {
            let Some(key) = key else { continue };
            if key == header::CONTENT_ENCODING || key == header::CONTENT_LENGTH {
                continue;
            }
            headers.insert(key, value);
        }
    }
    Ok(builder.body(Body::from_stream(stream))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params_with_system(system: Option<Value>) -> CreateMessageParams {
        CreateMessageParams {
            system,
            ..Default::default()
        }
    }

    #[test]
    fn system_sentence_leads_when_absent() {
        let mut params = params_with_system(None);
        inject_system(&mut params);
        let system = params.system.unwrap();
        assert_eq!(system[0]["text"], json!(CLAUDE_CODE_PROMPT));
        assert_eq!(system.as_array().unwrap().len(), 1);
    }

    #[test]
    fn string_system_becomes_trailing_block() {
        let mut params = params_with_system(Some(json!("prior prompt")));
        inject_system(&mut params);
        let system = params.system.unwrap();
        assert_eq!(system[0]["text"], json!(CLAUDE_CODE_PROMPT));
        assert_eq!(system[1]["text"], json!("prior prompt"));
    }

    #[test]
    fn existing_sentence_is_not_duplicated() {
        let mut params = params_with_system(Some(json!([
            { "type": "text", "text": CLAUDE_CODE_PROMPT },
            { "type": "text", "text": "rest" },
        ])));
        inject_system(&mut params);
        let system = params.system.unwrap();
        assert_eq!(system.as_array().unwrap().len(), 2);
        assert_eq!(system[0]["text"], json!(CLAUDE_CODE_PROMPT));
    }
}
