use axum::{Json, extract::rejection::JsonRejection, response::IntoResponse};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde_json::{Value, json};
use snafu::Location;
use strum::IntoStaticStr;
use tracing::{debug, error};
use wreq::StatusCode;

/// Application error enumeration.
///
/// Proxy-domain variants carry a stable six-digit code, an i18n message
/// key and a retryable bit; infrastructure variants render as plain 500s.
#[derive(Debug, IntoStaticStr, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
#[strum(serialize_all = "snake_case")]
pub enum CloverError {
    #[snafu(display("No API key provided"))]
    NoApiKeyProvided,
    #[snafu(display("Invalid API key"))]
    InvalidApiKey,
    #[snafu(display("No accounts available"))]
    NoAccountsAvailable,
    #[snafu(display("Rate limited by Claude, resets at {}", resets_at))]
    ClaudeRateLimited { resets_at: DateTime<Utc> },
    #[snafu(display("Blocked by Cloudflare, check your IP address"))]
    CloudflareBlocked,
    #[snafu(display("This organization has been disabled"))]
    OrganizationDisabled,
    #[snafu(display("Invalid model name: {}", model))]
    InvalidModelName { model: String },
    #[snafu(display("Claude authentication failed"))]
    ClaudeAuthentication,
    #[snafu(display("Claude HTTP error {}: {}", code, body))]
    ClaudeHttp { code: StatusCode, body: Value },
    #[snafu(display("No valid messages in request"))]
    NoValidMessages,
    #[snafu(display("Failed to download external image: {}", url))]
    ExternalImageDownload { url: String },
    #[snafu(display("External images are not allowed: {}", url))]
    ExternalImageNotAllowed { url: String },
    #[snafu(display("Pipeline produced no response"))]
    NoResponse,
    #[snafu(display("OAuth code exchange failed: {}", reason))]
    OAuthExchange { reason: String },
    #[snafu(display("Failed to fetch organization info: {}", reason))]
    OrganizationInfo { reason: String },
    #[snafu(display("Cookie authorization failed: {}", reason))]
    CookieAuthorization { reason: String },
    #[snafu(display("OAuth authentication is currently not allowed"))]
    OAuthNotAllowed,
    #[snafu(display("Streaming error from upstream: {}: {}", error_type, message))]
    ClaudeStreaming { error_type: String, message: String },
    #[snafu(display("Stream drained without producing a message"))]
    NoMessage,

    // infrastructure
    #[snafu(display("Wreq error: {}, source: {}", msg, source))]
    Wreq {
        msg: &'static str,
        source: wreq::Error,
    },
    #[snafu(display("JSON error: {}", source))]
    #[snafu(context(false))]
    Json { source: serde_json::Error },
    #[snafu(display("IO error: {}, at: {}", source, loc))]
    #[snafu(context(false))]
    Io {
        #[snafu(implicit)]
        loc: Location,
        source: std::io::Error,
    },
    #[snafu(display("HTTP error: {}", source))]
    #[snafu(context(false))]
    Http { source: http::Error },
    #[snafu(display("Invalid header value: {}", source))]
    #[snafu(context(false))]
    InvalidHeaderValue {
        source: http::header::InvalidHeaderValue,
    },
    #[snafu(display("URL parse error: {} (url: {})", source, url))]
    Url {
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("Actor error: {}", msg))]
    Ractor {
        #[snafu(implicit)]
        loc: Location,
        msg: String,
    },
    #[snafu(transparent)]
    JsonRejection { source: JsonRejection },
    #[snafu(display("{}", msg))]
    NotFound { msg: &'static str },
    #[snafu(display("Unexpected None: {}", msg))]
    UnexpectedNone { msg: &'static str },
}

impl CloverError {
    /// Stable six-digit error code for proxy-domain errors
    pub fn error_code(&self) -> Option<u32> {
        use CloverError::*;
        let code = match self {
            NoApiKeyProvided => 401010,
            InvalidApiKey => 401011,
            NoAccountsAvailable => 503100,
            ClaudeRateLimited { .. } => 429120,
            CloudflareBlocked => 503121,
            OrganizationDisabled => 400122,
            InvalidModelName { .. } => 400123,
            ClaudeAuthentication => 400124,
            ClaudeHttp { .. } => 503130,
            NoValidMessages => 400140,
            ExternalImageDownload { .. } => 503141,
            ExternalImageNotAllowed { .. } => 400142,
            NoResponse => 503160,
            OAuthExchange { .. } => 400180,
            OrganizationInfo { .. } => 503181,
            CookieAuthorization { .. } => 400182,
            OAuthNotAllowed => 401183,
            ClaudeStreaming { .. } => 503500,
            NoMessage => 503501,
            _ => return None,
        };
        Some(code)
    }

    /// i18n message key; the catalog itself is an external concern
    pub fn message_key(&self) -> &'static str {
        use CloverError::*;
        match self {
            NoApiKeyProvided => "global.noAPIKeyProvided",
            InvalidApiKey => "global.invalidAPIKey",
            NoAccountsAvailable => "accountPool.noAccountsAvailable",
            ClaudeRateLimited { .. } => "claudeClient.claudeRateLimited",
            CloudflareBlocked => "claudeClient.cloudflareBlocked",
            OrganizationDisabled => "claudeClient.organizationDisabled",
            InvalidModelName { .. } => "claudeClient.invalidModelName",
            ClaudeAuthentication => "claudeClient.authenticationError",
            ClaudeHttp { .. } => "claudeClient.httpError",
            NoValidMessages => "messageProcessor.noValidMessages",
            ExternalImageDownload { .. } => "messageProcessor.externalImageDownloadError",
            ExternalImageNotAllowed { .. } => "messageProcessor.externalImageNotAllowed",
            NoResponse => "pipeline.noResponse",
            OAuthExchange { .. } => "oauthService.oauthExchangeError",
            OrganizationInfo { .. } => "oauthService.organizationInfoError",
            CookieAuthorization { .. } => "oauthService.cookieAuthorizationError",
            OAuthNotAllowed => "oauthService.oauthNotAllowed",
            ClaudeStreaming { .. } => "pipeline.streamingError",
            NoMessage => "pipeline.noMessage",
            _ => "global.internalServerError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        use CloverError::*;
        match self {
            NoApiKeyProvided | InvalidApiKey | OAuthNotAllowed => StatusCode::UNAUTHORIZED,
            ClaudeRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            NoAccountsAvailable
            | CloudflareBlocked
            | ExternalImageDownload { .. }
            | NoResponse
            | OrganizationInfo { .. }
            | ClaudeStreaming { .. }
            | NoMessage => StatusCode::SERVICE_UNAVAILABLE,
            OrganizationDisabled
            | InvalidModelName { .. }
            | ClaudeAuthentication
            | NoValidMessages
            | ExternalImageNotAllowed { .. }
            | OAuthExchange { .. }
            | CookieAuthorization { .. } => StatusCode::BAD_REQUEST,
            ClaudeHttp { code, .. } => *code,
            JsonRejection { source } => source.status(),
            NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the outer handler may rerun the whole pipeline
    pub fn retryable(&self) -> bool {
        use CloverError::*;
        matches!(
            self,
            ClaudeRateLimited { .. }
                | OrganizationDisabled
                | ClaudeHttp { .. }
                | ClaudeStreaming { .. }
                | NoMessage
        )
    }

    /// Structured context rendered alongside the message
    pub fn context(&self) -> Option<Value> {
        use CloverError::*;
        match self {
            ClaudeRateLimited { resets_at } => Some(json!({
                "resets_at": resets_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            })),
            InvalidModelName { model } => Some(json!({ "model_name": model })),
            ClaudeHttp { code, body } => Some(json!({
                "status_code": code.as_u16(),
                "error": body,
            })),
            ExternalImageDownload { url } | ExternalImageNotAllowed { url } => {
                Some(json!({ "url": url }))
            }
            OAuthExchange { reason } | OrganizationInfo { reason }
            | CookieAuthorization { reason } => Some(json!({ "reason": reason })),
            ClaudeStreaming {
                error_type,
                message,
            } => Some(json!({
                "error_type": error_type,
                "error_message": message,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for CloverError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{}", self.to_string().red());
        } else {
            debug!("{self}");
        }
        let mut detail = json!({
            "code": self.error_code().unwrap_or(500000),
            "message": self.to_string(),
            "message_key": self.message_key(),
        });
        if let Some(context) = self.context() {
            detail["context"] = context;
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Error body shape served by Claude endpoints
#[derive(Debug, serde::Deserialize)]
pub struct ClaudeErrorBody {
    pub error: ClaudeErrorInner,
}

#[derive(Debug)]
pub struct ClaudeErrorInner {
    pub message: Value,
    pub r#type: String,
}

impl<'de> serde::Deserialize<'de> for ClaudeErrorInner {
    /// The upstream `message` is sometimes a JSON document in a string
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[serde(default)]
            message: String,
            #[serde(default, rename = "type")]
            type_: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        let message = serde_json::from_str::<Value>(&raw.message).unwrap_or(json!(raw.message));
        Ok(ClaudeErrorInner {
            message,
            r#type: raw.type_,
        })
    }
}

/// Classifies non-success responses from Claude.ai and the Anthropic API
pub trait CheckClaudeResponse
where
    Self: Sized,
{
    fn check_claude(self) -> impl Future<Output = Result<Self, CloverError>>;
}

impl CheckClaudeResponse for wreq::Response {
    async fn check_claude(self) -> Result<Self, CloverError> {
        let status = self.status();
        if status.is_success() {
            return Ok(self);
        }
        debug!("upstream error status: {}", status);
        if status == StatusCode::FOUND {
            // Cloudflare serves its challenge as a redirect
            return Err(CloverError::CloudflareBlocked);
        }
        let reset_header = self
            .headers()
            .get("anthropic-ratelimit-unified-reset")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<i64>().ok());
        let text = self.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ClaudeErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(ClaudeErrorInner {
                message: json!(format!("Unknown error: {text}")),
                r#type: "error_parse_error_body".to_string(),
            });
        if status == StatusCode::BAD_REQUEST
            && body.message == json!("This organization has been disabled.")
        {
            return Err(CloverError::OrganizationDisabled);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let ts = body.message["resetsAt"].as_i64().or(reset_header);
            let resets_at = ts
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
            error!(
                "Rate limit exceeded, resets in {} minutes",
                (resets_at - Utc::now()).num_minutes()
            );
            return Err(CloverError::ClaudeRateLimited { resets_at });
        }
        Err(CloverError::ClaudeHttp {
            code: status,
            body: json!({ "message": body.message, "type": body.r#type }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_six_digits() {
        let errors = [
            CloverError::NoApiKeyProvided,
            CloverError::InvalidApiKey,
            CloverError::NoAccountsAvailable,
            CloverError::CloudflareBlocked,
            CloverError::OrganizationDisabled,
            CloverError::NoValidMessages,
            CloverError::NoResponse,
            CloverError::NoMessage,
        ];
        for e in errors {
            let code = e.error_code().unwrap();
            assert!((100000..1000000).contains(&code), "{code}");
            // leading three digits match the HTTP status
            assert_eq!(code / 1000, e.status_code().as_u16() as u32);
        }
    }

    #[test]
    fn retryable_set_matches_taxonomy() {
        assert!(
            CloverError::ClaudeRateLimited {
                resets_at: Utc::now()
            }
            .retryable()
        );
        assert!(CloverError::OrganizationDisabled.retryable());
        assert!(CloverError::NoMessage.retryable());
        assert!(!CloverError::NoAccountsAvailable.retryable());
        assert!(!CloverError::CloudflareBlocked.retryable());
        assert!(
            !CloverError::InvalidModelName {
                model: "m".to_string()
            }
            .retryable()
        );
    }

    #[test]
    fn claude_error_inner_parses_nested_json_message() {
        let raw = r#"{"error":{"type":"rate_limit","message":"{\"resetsAt\": 1720000000}"}}"#;
        let body: ClaudeErrorBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.error.message["resetsAt"].as_i64(), Some(1720000000));
    }
}
