use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    claude_web::merge_messages,
    config::CLOVER_CONFIG,
    error::CloverError,
    pipeline::{PipelineContext, Processor, names},
    types::web::{Attachment, WebRequestBody},
    utils::TIME_ZONE,
};

/// Fallback path: a Claude.ai web conversation driven through a pooled
/// session. Merges the structured request into one prompt attachment,
/// uploads images, and streams the completion.
pub struct ClaudeWebProcessor;

#[async_trait]
impl Processor for ClaudeWebProcessor {
    fn name(&self) -> &'static str {
        names::CLAUDE_WEB
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<(), CloverError> {
        if ctx.response.is_some() || ctx.original_stream.is_some() {
            return Ok(());
        }
        if ctx.request.messages.is_empty() {
            return Err(CloverError::NoValidMessages);
        }

        let session_id = ctx.session_id.to_owned().unwrap_or_else(|| {
            format!("session_{}", chrono::Utc::now().timestamp_millis())
        });
        ctx.session_id = Some(session_id.to_owned());
        let session = match ctx.session.to_owned() {
            Some(session) => session,
            None => ctx.state.sessions.get_or_create(&session_id).await?,
        };
        ctx.session = Some(session.to_owned());

        if ctx.web_request.is_none() {
            let (mut merged, images) =
                merge_messages(&ctx.request.messages, ctx.request.system.as_ref()).await?;
            if merged.is_empty() {
                return Err(CloverError::NoValidMessages);
            }
            let config = CLOVER_CONFIG.load();
            if config.padtxt_length > 0 {
                merged = format!(
                    "{}{merged}",
                    padding_text(config.padtxt_length, &config.pad_tokens)
                );
                debug!("Prepended {} padding tokens", config.padtxt_length);
            }
            let prompt = config.custom_prompt.to_owned().unwrap_or_default();
            drop(config);

            let mut files = Vec::with_capacity(images.len());
            for (i, image) in images.iter().enumerate() {
                let Ok(bytes) = BASE64_STANDARD.decode(&image.data) else {
                    warn!("Image {i} is not valid base64, skipping");
                    continue;
                };
                match session
                    .upload_file(bytes, format!("image_{i}.png"), &image.media_type)
                    .await
                {
                    Ok(file_uuid) => {
                        debug!("Uploaded image {i}: {file_uuid}");
                        files.push(file_uuid);
                    }
                    Err(e) => warn!("Failed to upload image {i}: {e}"),
                }
            }

            let paprika = (session.account().is_pro()
                && ctx
                    .request
                    .thinking
                    .as_ref()
                    .is_some_and(|t| t.is_enabled()))
            .then_some("extended");
            session.set_paprika_mode(paprika).await?;

            ctx.web_request = Some(WebRequestBody {
                max_tokens_to_sample: ctx.request.max_tokens,
                attachments: vec![Attachment::from_text(merged)],
                files,
                model: Some(ctx.request.model.to_owned()),
                rendering_mode: "messages".to_string(),
                prompt,
                timezone: TIME_ZONE.to_string(),
                tools: ctx.request.tools.to_owned().unwrap_or_default(),
            });
        }

        let Some(ref body) = ctx.web_request else {
            return Err(CloverError::UnexpectedNone {
                msg: "web request was not built",
            });
        };
        session.send_message(body).await?;
        info!(
            "Web completion sent for session {session_id} with account {}",
            session.account().ellipse()
        );
        ctx.original_stream = Some(session.read_lines(ctx.state.sessions.to_owned()));
        Ok(())
    }
}

/// Random padding drawn from the configured tokens, alphanumerics
/// otherwise
fn padding_text(length: usize, pad_tokens: &[String]) -> String {
    let mut rng = rand::rng();
    if pad_tokens.is_empty() {
        const ALPHANUMERIC: &[u8] =
            b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        return (0..length)
            .map(|_| ALPHANUMERIC[rng.random_range(0..ALPHANUMERIC.len())] as char)
            .collect();
    }
    (0..length)
        .map(|_| pad_tokens[rng.random_range(0..pad_tokens.len())].as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::AppState,
        types::claude::{CreateMessageParams, InputMessage, Role},
    };

    #[tokio::test]
    async fn empty_messages_raise_no_valid_messages() {
        let state = AppState::new_in_memory().await.unwrap();
        let request = CreateMessageParams::default();
        let mut ctx = crate::pipeline::PipelineContext::new(state, request, None);
        let err = ClaudeWebProcessor.process(&mut ctx).await.unwrap_err();
        assert!(matches!(err, CloverError::NoValidMessages));
    }

    #[tokio::test]
    async fn no_accounts_propagates() {
        let state = AppState::new_in_memory().await.unwrap();
        let request = CreateMessageParams {
            messages: vec![InputMessage::text(Role::User, "hello")],
            ..Default::default()
        };
        let mut ctx = crate::pipeline::PipelineContext::new(state, request, None);
        let err = ClaudeWebProcessor.process(&mut ctx).await.unwrap_err();
        assert!(matches!(err, CloverError::NoAccountsAvailable));
    }

    #[test]
    fn padding_uses_configured_tokens() {
        let padded = padding_text(4, &["ab".to_string(), "cd".to_string()]);
        assert_eq!(padded.len(), 8);
        assert!(padded.as_bytes().chunks(2).all(|c| c == b"ab" || c == b"cd"));
        let alnum = padding_text(16, &[]);
        assert_eq!(alnum.len(), 16);
        assert!(alnum.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
