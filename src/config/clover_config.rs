use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use colored::Colorize;
use figment::{
    Figment,
    providers::{Env, Format, Json},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt::Display, net::SocketAddr, path::PathBuf, sync::LazyLock};
use tracing::{error, warn};
use url::Url;

use crate::{
    config::{
        ACCOUNTS_NAME, CONFIG_NAME, LOG_DIR_NAME, default_account_task_interval,
        default_assistant_name, default_cache_cleanup_interval, default_cache_timeout,
        default_claude_ai_url, default_claude_api_baseurl, default_data_folder, default_host,
        default_human_name, default_max_models, default_max_sessions_per_cookie,
        default_oauth_authorize_url, default_oauth_client_id, default_oauth_redirect_uri,
        default_oauth_token_url, default_port, default_request_retries,
        default_request_retry_interval, default_request_timeout, default_retry_attempts,
        default_retry_interval, default_session_cleanup_interval, default_session_timeout,
        default_tool_call_cleanup_interval, default_tool_call_timeout, default_use_real_roles,
    },
    error::CloverError,
    utils::enabled,
};

/// Temporary admin key generated when no admin keys are configured.
/// Never persisted; valid for the lifetime of the process.
pub static TEMP_ADMIN_KEY: LazyLock<Option<String>> = LazyLock::new(|| {
    if !CLOVER_CONFIG_BOOT_ADMIN_EMPTY.load(std::sync::atomic::Ordering::Relaxed) {
        return None;
    }
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let key = format!("sk-admin-{}", BASE64_URL_SAFE_NO_PAD.encode(bytes));
    warn!(
        "No admin API keys configured. Generated temporary admin API key: {}",
        key.yellow()
    );
    warn!("This key is not saved. Configure admin_api_keys in settings.");
    Some(key)
});

static CLOVER_CONFIG_BOOT_ADMIN_EMPTY: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);

/// Application configuration.
///
/// Loaded from `data_folder/config.json` (a partial snapshot containing
/// only overridden fields) merged with `CLOVER_`-prefixed environment
/// variables; hot-reloadable through the settings endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CloverConfig {
    // server, not hot reloadable
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_folder")]
    pub data_folder: PathBuf,
    #[serde(default)]
    pub no_filesystem_mode: bool,
    #[serde(default)]
    pub log_to_file: bool,

    // network
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_claude_ai_url")]
    pub claude_ai_url: Url,
    #[serde(default = "default_claude_api_baseurl")]
    pub claude_api_baseurl: Url,

    // authentication
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub admin_api_keys: Vec<String>,

    // credential seeds
    #[serde(default)]
    pub cookies: Vec<String>,

    // prompt shaping
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default = "default_use_real_roles")]
    pub use_real_roles: bool,
    #[serde(default = "default_human_name")]
    pub human_name: String,
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    #[serde(default)]
    pub padtxt_length: usize,
    #[serde(default)]
    pub pad_tokens: Vec<String>,
    #[serde(default)]
    pub allow_external_images: bool,
    #[serde(default)]
    pub preserve_chats: bool,

    // request handling
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_request_retries")]
    pub request_retries: usize,
    #[serde(default = "default_request_retry_interval")]
    pub request_retry_interval: u64,

    // session management
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    #[serde(default = "default_session_cleanup_interval")]
    pub session_cleanup_interval: u64,
    #[serde(default = "default_max_sessions_per_cookie")]
    pub max_sessions_per_cookie: usize,
    #[serde(default = "default_account_task_interval")]
    pub account_task_interval: u64,

    // tool calls
    #[serde(default = "default_tool_call_timeout")]
    pub tool_call_timeout: u64,
    #[serde(default = "default_tool_call_cleanup_interval")]
    pub tool_call_cleanup_interval: u64,

    // prompt cache
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout: u64,
    #[serde(default = "default_cache_cleanup_interval")]
    pub cache_cleanup_interval: u64,

    // oauth
    #[serde(default = "default_oauth_client_id")]
    pub oauth_client_id: String,
    #[serde(default = "default_oauth_authorize_url")]
    pub oauth_authorize_url: String,
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,
    #[serde(default = "default_oauth_redirect_uri")]
    pub oauth_redirect_uri: String,

    // models that require a max-plan account
    #[serde(default = "default_max_models")]
    pub max_models: Vec<String>,

    #[serde(skip)]
    pub wreq_proxy: Option<wreq::Proxy>,
}

impl Default for CloverConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .expect("defaults deserialize cleanly")
    }
}

impl CloverConfig {
    /// Loads configuration from the JSON snapshot and environment
    pub fn new() -> Self {
        let config: CloverConfig = Figment::from(Json::file(Self::config_path_static()))
            .admerge(Env::prefixed("CLOVER_"))
            .extract_lossy()
            .inspect_err(|e| error!("Failed to load config: {e}"))
            .unwrap_or_default();
        config.validate()
    }

    fn config_path_static() -> PathBuf {
        crate::config::CLOVER_DIR.join(CONFIG_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_folder.join(CONFIG_NAME)
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.data_folder.join(ACCOUNTS_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_folder.join(LOG_DIR_NAME)
    }

    pub fn address(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }

    pub fn user_auth(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key) || self.admin_auth(key)
    }

    pub fn admin_auth(&self, key: &str) -> bool {
        self.admin_api_keys.iter().any(|k| k == key)
            || TEMP_ADMIN_KEY.as_deref().is_some_and(|k| k == key)
    }

    pub fn is_max_model(&self, model: &str) -> bool {
        self.max_models.iter().any(|m| m == model)
    }

    /// Validate and normalize the configuration
    pub fn validate(mut self) -> Self {
        if self.admin_api_keys.is_empty() {
            CLOVER_CONFIG_BOOT_ADMIN_EMPTY.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        self.retry_attempts = self.retry_attempts.max(1);
        self.max_sessions_per_cookie = self.max_sessions_per_cookie.max(1);
        self.wreq_proxy = self.proxy_url.to_owned().and_then(|p| {
            wreq::Proxy::all(&p)
                .inspect_err(|e| {
                    error!("Failed to parse proxy: {e}");
                })
                .ok()
        });
        if self.wreq_proxy.is_none() {
            self.proxy_url = None;
        }
        self
    }

    /// Merge a partial settings patch into the on-disk snapshot and
    /// return the updated effective configuration
    pub async fn apply_patch(&self, patch: &Value) -> Result<CloverConfig, CloverError> {
        let mut effective = serde_json::to_value(self)?;
        merge_objects(&mut effective, patch);
        let updated: CloverConfig = serde_json::from_value(effective)?;
        let updated = updated.validate();

        if !self.no_filesystem_mode {
            let path = self.config_path();
            let mut snapshot = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => serde_json::from_str::<Value>(&raw)
                    .unwrap_or(Value::Object(Default::default())),
                Err(_) => Value::Object(Default::default()),
            };
            merge_objects(&mut snapshot, patch);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, serde_json::to_string_pretty(&snapshot)?).await?;
        }
        Ok(updated)
    }
}

fn merge_objects(base: &mut Value, patch: &Value) {
    if let (Value::Object(base), Value::Object(patch)) = (base, patch) {
        for (k, v) in patch {
            if v.is_null() {
                base.remove(k);
            } else {
                base.insert(k.to_owned(), v.to_owned());
            }
        }
    }
}

impl Display for CloverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Messages Endpoint: {}",
            format!("http://{}/v1/messages", self.address())
                .green()
                .underline()
        )?;
        writeln!(f, "Data folder: {}", self.data_folder.display())?;
        writeln!(f, "Client API keys: {}", self.api_keys.len())?;
        writeln!(f, "Admin API keys: {}", self.admin_api_keys.len())?;
        if let Some(ref proxy) = self.proxy_url {
            writeln!(f, "Proxy: {}", proxy.blue())?;
        }
        writeln!(f, "Preserve chats: {}", enabled(self.preserve_chats))?;
        writeln!(
            f,
            "External images: {}",
            enabled(self.allow_external_images)
        )?;
        writeln!(f, "Real roles: {}", enabled(self.use_real_roles))?;
        if self.padtxt_length > 0 {
            writeln!(f, "Padding length: {}", self.padtxt_length.to_string().blue())?;
        }
        writeln!(f, "Filesystem: {}", enabled(!self.no_filesystem_mode))?;
        Ok(())
    }
}
