use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{TimestampSeconds, serde_as};
use tracing::info;

use crate::{
    account::{Account, AccountStatus, AuthType, OAuthToken},
    error::CloverError,
    state::AppState,
};

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct OAuthTokenIntake {
    pub access_token: String,
    pub refresh_token: String,
    #[serde_as(as = "TimestampSeconds<i64>")]
    pub expires_at: DateTime<Utc>,
}

impl From<OAuthTokenIntake> for OAuthToken {
    fn from(intake: OAuthTokenIntake) -> Self {
        OAuthToken {
            access_token: intake.access_token,
            refresh_token: intake.refresh_token,
            expires_at: intake.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountCreate {
    pub cookie_value: Option<String>,
    pub oauth_token: Option<OAuthTokenIntake>,
    pub organization_uuid: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCodeExchange {
    pub organization_uuid: String,
    pub code: String,
    pub pkce_verifier: String,
    pub capabilities: Option<Vec<String>>,
}

/// Account view with the cookie masked
#[serde_as]
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub organization_uuid: String,
    pub capabilities: Vec<String>,
    pub cookie_value: Option<String>,
    pub status: AccountStatus,
    pub auth_type: AuthType,
    pub is_pro: bool,
    pub is_max: bool,
    pub has_oauth: bool,
    #[serde_as(as = "TimestampSeconds<i64>")]
    pub last_used: DateTime<Utc>,
    #[serde_as(as = "Option<TimestampSeconds<i64>>")]
    pub resets_at: Option<DateTime<Utc>>,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        let masked = account.cookie_value.as_deref().map(|c| {
            if c.len() > 20 {
                format!("{}...", &c[..20])
            } else {
                c.to_string()
            }
        });
        Self {
            is_pro: account.is_pro(),
            is_max: account.is_max(),
            has_oauth: account.has_oauth(),
            organization_uuid: account.organization_uuid,
            capabilities: account.capabilities,
            cookie_value: masked,
            status: account.status,
            auth_type: account.auth_type,
            last_used: account.last_used,
            resets_at: account.resets_at,
        }
    }
}

pub async fn api_list_accounts(
    State(state): State<AppState>,
) -> Result<Json<Vec<AccountView>>, CloverError> {
    let accounts = state.pool.list().await?;
    Ok(Json(accounts.into_iter().map(AccountView::from).collect()))
}

pub async fn api_create_account(
    State(state): State<AppState>,
    Json(body): Json<AccountCreate>,
) -> Result<Json<AccountView>, CloverError> {
    let account = state
        .pool
        .add(
            body.cookie_value,
            body.oauth_token.map(OAuthToken::from),
            body.organization_uuid,
            body.capabilities,
        )
        .await?;
    info!("Account {} accepted via admin API", account.ellipse());
    Ok(Json(account.into()))
}

pub async fn api_get_account(
    State(state): State<AppState>,
    Path(organization_uuid): Path<String>,
) -> Result<Json<AccountView>, CloverError> {
    let account = state
        .pool
        .list()
        .await?
        .into_iter()
        .find(|a| a.organization_uuid == organization_uuid)
        .ok_or(CloverError::NotFound {
            msg: "account not found",
        })?;
    Ok(Json(account.into()))
}

#[derive(Debug, Deserialize)]
pub struct AccountUpdate {
    pub cookie_value: Option<String>,
    pub oauth_token: Option<OAuthTokenIntake>,
    pub capabilities: Option<Vec<String>>,
}

/// Merge fresh credentials into an existing account
pub async fn api_update_account(
    State(state): State<AppState>,
    Path(organization_uuid): Path<String>,
    Json(body): Json<AccountUpdate>,
) -> Result<Json<AccountView>, CloverError> {
    let known = state
        .pool
        .list()
        .await?
        .iter()
        .any(|a| a.organization_uuid == organization_uuid);
    if !known {
        return Err(CloverError::NotFound {
            msg: "account not found",
        });
    }
    let account = state
        .pool
        .add(
            body.cookie_value,
            body.oauth_token.map(OAuthToken::from),
            Some(organization_uuid),
            body.capabilities,
        )
        .await?;
    Ok(Json(account.into()))
}

pub async fn api_delete_account(
    State(state): State<AppState>,
    Path(organization_uuid): Path<String>,
) -> Result<StatusCode, CloverError> {
    state.pool.remove(organization_uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Completes a PKCE flow whose authorize step happened out of band
pub async fn api_oauth_exchange(
    State(state): State<AppState>,
    Json(body): Json<OAuthCodeExchange>,
) -> Result<Json<AccountView>, CloverError> {
    let token = state
        .pool
        .authenticator()
        .exchange_token(&body.code, &body.pkce_verifier)
        .await?;
    let account = state
        .pool
        .add(
            None,
            Some(token),
            Some(body.organization_uuid),
            body.capabilities,
        )
        .await?;
    Ok(Json(account.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_masks_long_cookies() {
        let account = Account::new(
            "org-view".to_string(),
            vec!["chat".to_string()],
            Some("sessionKey=sk-ant-REDACTED".to_string()),
            None,
        );
        let view = AccountView::from(account);
        assert_eq!(view.cookie_value.as_deref(), Some("sessionKey=sk-ant-si..."));
        assert!(!view.has_oauth);
        assert!(!view.is_max);
    }
}
