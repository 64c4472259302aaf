use std::sync::LazyLock;

use http::HeaderValue;
use serde_json::{Value, json};
use snafu::ResultExt;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;
use wreq::{
    Client, ClientBuilder, IntoUrl, Method, RequestBuilder,
    header::{ACCEPT, ORIGIN, REFERER},
    multipart::{Form, Part},
};
use wreq_util::Emulation;

use crate::{
    account::{Account, AccountPoolHandle},
    config::CLOVER_CONFIG,
    error::{CheckClaudeResponse, CloverError, WreqSnafu},
    types::web::{UploadResponse, WebRequestBody},
};

/// Shared browser-like client for calls that carry no account cookie
pub static SUPER_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    ClientBuilder::new()
        .emulation(Emulation::Chrome136)
        .build()
        .expect("Failed to build shared client")
});

/// Client for one account's view of the Claude.ai chat endpoints.
pub struct WebClient {
    client: Client,
    cookie_header: HeaderValue,
    org_uuid: String,
    endpoint: Url,
    pool: AccountPoolHandle,
}

impl WebClient {
    pub fn new(account: &Account, pool: AccountPoolHandle) -> Result<Self, CloverError> {
        let cookie = account
            .cookie_value
            .as_deref()
            .ok_or(CloverError::UnexpectedNone {
                msg: "web client needs a cookie-bearing account",
            })?;
        let mut builder = ClientBuilder::new()
            .cookie_store(true)
            .emulation(Emulation::Chrome136);
        if let Some(proxy) = CLOVER_CONFIG.load().wreq_proxy.to_owned() {
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context(WreqSnafu {
            msg: "Failed to build web client",
        })?;
        Ok(Self {
            client,
            cookie_header: HeaderValue::from_str(cookie)?,
            org_uuid: account.organization_uuid.to_owned(),
            endpoint: CLOVER_CONFIG.load().claude_ai_url.to_owned(),
            pool,
        })
    }

    pub fn org_uuid(&self) -> &str {
        &self.org_uuid
    }

    fn origin(&self) -> String {
        self.endpoint.as_str().trim_end_matches('/').to_string()
    }

    fn build_request(
        &self,
        method: Method,
        url: impl IntoUrl,
        conv_uuid: Option<&str>,
    ) -> RequestBuilder {
        let origin = self.origin();
        let referer = match conv_uuid {
            Some(conv) => format!("{origin}/chat/{conv}"),
            None => format!("{origin}/new"),
        };
        self.client
            .request(method, url)
            .header(ORIGIN, origin)
            .header(REFERER, referer)
            .header("Cookie", self.cookie_header.to_owned())
    }

    /// Send with transport retries, then classify the response.
    ///
    /// Rate-limit and disabled-organization verdicts are reported to the
    /// pool on the way out; `last_used` is touched on the way in.
    async fn request(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<wreq::Response, CloverError> {
        let config = CLOVER_CONFIG.load();
        let retries = config.request_retries;
        let backoff = std::time::Duration::from_secs(config.request_retry_interval);
        drop(config);
        let _ = self.pool.touch(self.org_uuid.to_owned()).await;

        let mut attempt = 0;
        let res = loop {
            match build().send().await {
                Ok(res) => break res,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!("Transport error (attempt {attempt}): {e}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(e).context(WreqSnafu {
                        msg: "Upstream request failed",
                    });
                }
            }
        };
        match res.check_claude().await {
            Ok(res) => Ok(res),
            Err(e) => {
                self.pool.report(&self.org_uuid, &e).await;
                Err(e)
            }
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.origin(), path)
    }

    /// Create a conversation; returns its uuid and the server-assigned
    /// paprika mode
    pub async fn create_conversation(&self) -> Result<(String, Option<String>), CloverError> {
        let conv_uuid = Uuid::new_v4().to_string();
        let url = self.api_url(&format!(
            "/api/organizations/{}/chat_conversations",
            self.org_uuid
        ));
        let body = json!({
            "uuid": conv_uuid,
            "name": format!("clover-{}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")),
        });
        let res = self
            .request(|| {
                self.build_request(Method::POST, url.to_owned(), None)
                    .json(&body)
                    .timeout(request_timeout())
            })
            .await?;
        let data = res.json::<Value>().await.context(WreqSnafu {
            msg: "Failed to parse conversation response",
        })?;
        let uuid = data
            .get("uuid")
            .and_then(|u| u.as_str())
            .unwrap_or(conv_uuid.as_str())
            .to_string();
        let paprika_mode = data
            .pointer("/settings/paprika_mode")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        debug!("Created conversation {uuid}");
        Ok((uuid, paprika_mode))
    }

    pub async fn set_paprika_mode(
        &self,
        conv_uuid: &str,
        mode: Option<&str>,
    ) -> Result<(), CloverError> {
        let url = self.api_url(&format!(
            "/api/organizations/{}/chat_conversations/{}",
            self.org_uuid, conv_uuid
        ));
        let body = json!({ "settings": { "paprika_mode": mode } });
        self.request(|| {
            self.build_request(Method::PUT, url.to_owned(), Some(conv_uuid))
                .json(&body)
                .timeout(request_timeout())
        })
        .await?;
        debug!("Set conversation {conv_uuid} paprika mode: {mode:?}");
        Ok(())
    }

    pub async fn upload_file(
        &self,
        bytes: Vec<u8>,
        file_name: String,
        content_type: &str,
    ) -> Result<String, CloverError> {
        let url = self.api_url(&format!("/api/{}/upload", self.org_uuid));
        let content_type = content_type.to_string();
        let res = self
            .request(move || {
                let part = Part::bytes(bytes.to_owned())
                    .file_name(file_name.to_owned())
                    .mime_str(&content_type)
                    .unwrap_or_else(|_| {
                        Part::bytes(bytes.to_owned()).file_name(file_name.to_owned())
                    });
                self.build_request(Method::POST, url.to_owned(), None)
                    .multipart(Form::new().part("file", part))
                    .timeout(request_timeout())
            })
            .await?;
        let data = res.json::<UploadResponse>().await.context(WreqSnafu {
            msg: "Failed to parse upload response",
        })?;
        Ok(data.file_uuid)
    }

    /// Send a completion request; the response body is the SSE stream
    pub async fn send_message(
        &self,
        conv_uuid: &str,
        body: &WebRequestBody,
    ) -> Result<wreq::Response, CloverError> {
        let url = self.api_url(&format!(
            "/api/organizations/{}/chat_conversations/{}/completion",
            self.org_uuid, conv_uuid
        ));
        self.request(|| {
            self.build_request(Method::POST, url.to_owned(), Some(conv_uuid))
                .json(body)
                .header(ACCEPT, "text/event-stream")
        })
        .await
    }

    pub async fn send_tool_result(
        &self,
        conv_uuid: &str,
        payload: &Value,
    ) -> Result<(), CloverError> {
        let url = self.api_url(&format!(
            "/api/organizations/{}/chat_conversations/{}/tool_result",
            self.org_uuid, conv_uuid
        ));
        self.request(|| {
            self.build_request(Method::POST, url.to_owned(), Some(conv_uuid))
                .json(payload)
                .timeout(request_timeout())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_conversation(&self, conv_uuid: &str) -> Result<(), CloverError> {
        let url = self.api_url(&format!(
            "/api/organizations/{}/chat_conversations/{}",
            self.org_uuid, conv_uuid
        ));
        debug!("Deleting conversation {conv_uuid}");
        let _ = self
            .build_request(Method::DELETE, url, Some(conv_uuid))
            .timeout(request_timeout())
            .send()
            .await
            .inspect_err(|e| warn!("Failed to delete conversation: {e}"));
        Ok(())
    }
}

fn request_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(CLOVER_CONFIG.load().request_timeout)
}
