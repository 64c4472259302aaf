use std::sync::Arc;

use axum::Json;
use serde_json::Value;
use tracing::info;

use crate::{config::CLOVER_CONFIG, error::CloverError};

/// `GET /settings`: the effective configuration
pub async fn api_get_settings() -> Result<Json<Value>, CloverError> {
    let config = serde_json::to_value(CLOVER_CONFIG.load().as_ref())?;
    Ok(Json(config))
}

/// `PUT /settings`: merge a partial patch into the on-disk snapshot and
/// hot-reload the effective configuration
pub async fn api_put_settings(Json(patch): Json<Value>) -> Result<Json<Value>, CloverError> {
    if !patch.is_object() {
        return Err(CloverError::UnexpectedNone {
            msg: "settings patch must be a JSON object",
        });
    }
    let updated = CLOVER_CONFIG.load().apply_patch(&patch).await?;
    CLOVER_CONFIG.store(Arc::new(updated));
    info!("Settings updated");
    api_get_settings().await
}

/// `GET /statistics`: pool health and per-account stats
pub async fn api_statistics(
    state: axum::extract::State<crate::state::AppState>,
) -> Result<Json<Value>, CloverError> {
    let status = state.pool.status().await?;
    Ok(Json(serde_json::json!({
        "status": if status.valid_accounts > 0 { "healthy" } else { "degraded" },
        "accounts": status,
    })))
}
