use arc_swap::ArcSwap;
use std::{path::PathBuf, sync::LazyLock};
use url::Url;

use crate::config::CloverConfig;

pub const CONFIG_NAME: &str = "config.json";
pub const ACCOUNTS_NAME: &str = "accounts.json";
pub const LOG_DIR_NAME: &str = "log";

pub const CLAUDE_AI_URL: &str = "https://claude.ai";
pub const CLAUDE_API_BASEURL: &str = "https://api.anthropic.com";
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const OAUTH_AUTHORIZE_URL: &str = "https://claude.ai/v1/oauth/{organization_uuid}/authorize";
pub const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const OAUTH_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// System sentence injected on the OAuth API path
pub const CLAUDE_CODE_PROMPT: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// Tokens refreshed when expiring within this window
pub const TOKEN_REFRESH_WINDOW_SECS: i64 = 300;

pub static CLOVER_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    if let Ok(dir) = std::env::var("CLOVER_DATA_FOLDER") {
        return PathBuf::from(dir);
    }
    etcetera::home_dir()
        .map(|home| home.join(".clover").join("data"))
        .unwrap_or_else(|_| PathBuf::from(".clover-data"))
});

pub static CLOVER_CONFIG: LazyLock<ArcSwap<CloverConfig>> =
    LazyLock::new(|| ArcSwap::from_pointee(CloverConfig::new()));

// Default functions

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub const fn default_port() -> u16 {
    5201
}

pub fn default_data_folder() -> PathBuf {
    CLOVER_DIR.to_owned()
}

pub fn default_claude_ai_url() -> Url {
    Url::parse(CLAUDE_AI_URL).expect("valid claude.ai url")
}

pub fn default_claude_api_baseurl() -> Url {
    Url::parse(CLAUDE_API_BASEURL).expect("valid api url")
}

pub const fn default_use_real_roles() -> bool {
    true
}

pub fn default_human_name() -> String {
    "Human".to_string()
}

pub fn default_assistant_name() -> String {
    "Assistant".to_string()
}

pub const fn default_retry_attempts() -> usize {
    3
}

pub const fn default_retry_interval() -> u64 {
    1
}

pub const fn default_request_timeout() -> u64 {
    60
}

pub const fn default_request_retries() -> usize {
    3
}

pub const fn default_request_retry_interval() -> u64 {
    1
}

pub const fn default_session_timeout() -> u64 {
    300
}

pub const fn default_session_cleanup_interval() -> u64 {
    30
}

pub const fn default_max_sessions_per_cookie() -> usize {
    3
}

pub const fn default_account_task_interval() -> u64 {
    60
}

pub const fn default_tool_call_timeout() -> u64 {
    300
}

pub const fn default_tool_call_cleanup_interval() -> u64 {
    60
}

pub const fn default_cache_timeout() -> u64 {
    300
}

pub const fn default_cache_cleanup_interval() -> u64 {
    60
}

pub fn default_oauth_client_id() -> String {
    OAUTH_CLIENT_ID.to_string()
}

pub fn default_oauth_authorize_url() -> String {
    OAUTH_AUTHORIZE_URL.to_string()
}

pub fn default_oauth_token_url() -> String {
    OAUTH_TOKEN_URL.to_string()
}

pub fn default_oauth_redirect_uri() -> String {
    OAUTH_REDIRECT_URI.to_string()
}

pub fn default_max_models() -> Vec<String> {
    vec!["claude-opus-4-20250514".to_string()]
}
