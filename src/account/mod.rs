mod oauth;
mod pool;

pub use oauth::*;
pub use pool::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{TimestampSeconds, serde_as};

use crate::error::CloverError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Valid,
    Invalid,
    RateLimited,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    CookieOnly,
    OauthOnly,
    Both,
}

/// OAuth credential triple issued to Claude Code clients
#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    #[serde_as(as = "TimestampSeconds<i64>")]
    pub expires_at: DateTime<Utc>,
}

impl OAuthToken {
    pub fn expires_within(&self, secs: i64) -> bool {
        Utc::now() + chrono::Duration::seconds(secs) >= self.expires_at
    }
}

/// A credential bundle paired with an organization and its capabilities.
#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Account {
    pub organization_uuid: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub cookie_value: Option<String>,
    #[serde(default)]
    pub oauth_token: Option<OAuthToken>,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde_as(as = "TimestampSeconds<i64>")]
    pub last_used: DateTime<Utc>,
    #[serde_as(as = "Option<TimestampSeconds<i64>>")]
    #[serde(default)]
    pub resets_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(
        organization_uuid: String,
        capabilities: Vec<String>,
        cookie_value: Option<String>,
        oauth_token: Option<OAuthToken>,
    ) -> Self {
        let mut account = Self {
            organization_uuid,
            capabilities,
            cookie_value,
            oauth_token,
            status: AccountStatus::Valid,
            auth_type: AuthType::CookieOnly,
            last_used: Utc::now(),
            resets_at: None,
        };
        account.recompute_auth_type();
        account
    }

    /// auth_type is a pure function of credential presence
    pub fn recompute_auth_type(&mut self) {
        self.auth_type = match (self.cookie_value.is_some(), self.oauth_token.is_some()) {
            (true, true) => AuthType::Both,
            (false, true) => AuthType::OauthOnly,
            _ => AuthType::CookieOnly,
        };
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie_value.is_some()
    }

    pub fn has_oauth(&self) -> bool {
        self.oauth_token.is_some()
    }

    pub fn is_pro(&self) -> bool {
        const PRO_KEYWORDS: [&str; 4] = ["pro", "enterprise", "raven", "max"];
        self.capabilities.iter().any(|c| {
            let c = c.to_lowercase();
            PRO_KEYWORDS.iter().any(|k| c.contains(k))
        })
    }

    pub fn is_max(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.to_lowercase().contains("max"))
    }

    /// Mark rate limited until the given reset time
    pub fn rate_limit(&mut self, resets_at: DateTime<Utc>) {
        self.status = AccountStatus::RateLimited;
        self.resets_at = Some(resets_at);
    }

    /// Restore validity; always clears resets_at
    pub fn restore(&mut self) {
        self.status = AccountStatus::Valid;
        self.resets_at = None;
    }

    pub fn ellipse(&self) -> String {
        let id = &self.organization_uuid;
        if id.len() > 8 {
            format!("{}...", &id[..8])
        } else {
            id.to_owned()
        }
    }
}

/// Outcome of one scoped upstream attempt with a borrowed account
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    RateLimited(DateTime<Utc>),
    Disabled,
}

impl Verdict {
    /// Classify a request error into an account verdict, if any
    pub fn of(error: &CloverError) -> Option<Self> {
        match error {
            CloverError::ClaudeRateLimited { resets_at } => {
                Some(Verdict::RateLimited(resets_at.to_owned()))
            }
            CloverError::OrganizationDisabled => Some(Verdict::Disabled),
            _ => None,
        }
    }
}
