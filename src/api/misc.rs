use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::{error::CloverError, state::AppState};

/// `GET /health`: healthy while at least one account is VALID
pub async fn api_health(State(state): State<AppState>) -> Result<Json<Value>, CloverError> {
    let status = state.pool.status().await?;
    Ok(Json(json!({
        "status": if status.valid_accounts > 0 { "healthy" } else { "degraded" },
    })))
}

/// `GET /version`
pub async fn api_version() -> String {
    crate::VERSION_INFO.to_string()
}
