use axum::extract::FromRequestParts;
use axum_auth::AuthBearer;
use tracing::warn;

use crate::{config::CLOVER_CONFIG, error::CloverError};

/// The API key from either `X-API-Key` or `Authorization: Bearer`
async fn presented_key(parts: &mut axum::http::request::Parts) -> Result<String, CloverError> {
    if let Some(key) = parts
        .headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Ok(key.to_string());
    }
    if let Ok(AuthBearer(key)) = AuthBearer::from_request_parts(parts, &()).await {
        return Ok(key);
    }
    Err(CloverError::NoApiKeyProvided)
}

/// Guard for client endpoints; admin keys are accepted too.
pub struct RequireClientAuth;

impl<S> FromRequestParts<S> for RequireClientAuth
where
    S: Sync,
{
    type Rejection = CloverError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _: &S,
    ) -> Result<Self, Self::Rejection> {
        let key = presented_key(parts).await?;
        if !CLOVER_CONFIG.load().user_auth(&key) {
            warn!("Invalid API key presented");
            return Err(CloverError::InvalidApiKey);
        }
        Ok(Self)
    }
}

/// Guard for admin endpoints.
pub struct RequireAdminAuth;

impl<S> FromRequestParts<S> for RequireAdminAuth
where
    S: Sync,
{
    type Rejection = CloverError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _: &S,
    ) -> Result<Self, Self::Rejection> {
        let key = presented_key(parts).await?;
        if !CLOVER_CONFIG.load().admin_auth(&key) {
            warn!("Invalid admin API key presented");
            return Err(CloverError::InvalidApiKey);
        }
        Ok(Self)
    }
}
