use chrono::{Duration, Utc};
use oauth2::{CsrfToken, PkceCodeChallenge};
use serde::Deserialize;
use serde_json::{Value, json};
use snafu::ResultExt;
use tracing::{debug, info};
use url::Url;
use wreq::{
    ClientBuilder, StatusCode,
    header::{ACCEPT, ORIGIN, REFERER},
};
use wreq_util::Emulation;

use crate::{
    account::OAuthToken,
    config::CLOVER_CONFIG,
    error::{CloverError, WreqSnafu},
};

/// PKCE authorization-code flow against Claude.ai, driven by a session
/// cookie, plus token refresh against the console token endpoint.
#[derive(Clone)]
pub struct OauthAuthenticator {
    client: wreq::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

impl From<TokenResponse> for OAuthToken {
    fn from(raw: TokenResponse) -> Self {
        OAuthToken {
            access_token: raw.access_token,
            refresh_token: raw.refresh_token,
            expires_at: Utc::now() + Duration::seconds(raw.expires_in),
        }
    }
}

impl OauthAuthenticator {
    pub fn new() -> Result<Self, CloverError> {
        let mut builder = ClientBuilder::new()
            .cookie_store(true)
            .emulation(Emulation::Chrome136);
        if let Some(proxy) = CLOVER_CONFIG.load().wreq_proxy.to_owned() {
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context(WreqSnafu {
            msg: "Failed to build oauth client",
        })?;
        Ok(Self { client })
    }

    fn cookie_request(&self, method: wreq::Method, url: impl wreq::IntoUrl, cookie: &str) -> wreq::RequestBuilder {
        let endpoint = CLOVER_CONFIG.load().claude_ai_url.to_owned();
        let origin = endpoint.as_str().trim_end_matches('/').to_string();
        self.client
            .request(method, url)
            .header(ACCEPT, "application/json")
            .header(ORIGIN, origin.as_str())
            .header(REFERER, format!("{origin}/new"))
            .header("Cookie", cookie)
            .timeout(std::time::Duration::from_secs(
                CLOVER_CONFIG.load().request_timeout,
            ))
    }

    async fn check(res: wreq::Response) -> Result<wreq::Response, CloverError> {
        let status = res.status();
        if status.as_u16() < 300 {
            return Ok(res);
        }
        if status == StatusCode::FOUND {
            return Err(CloverError::CloudflareBlocked);
        }
        if status == StatusCode::FORBIDDEN {
            return Err(CloverError::ClaudeAuthentication);
        }
        let body = res.text().await.unwrap_or_default();
        Err(CloverError::ClaudeHttp {
            code: status,
            body: serde_json::from_str(&body).unwrap_or(json!(body)),
        })
    }

    /// Fetch the user's organizations and pick the chat-capable one with
    /// the largest capability set
    pub async fn get_organization_info(
        &self,
        cookie: &str,
    ) -> Result<(String, Vec<String>), CloverError> {
        let endpoint = format!(
            "{}api/organizations",
            CLOVER_CONFIG.load().claude_ai_url.as_str()
        );
        let res = self
            .cookie_request(wreq::Method::GET, endpoint, cookie)
            .send()
            .await
            .context(WreqSnafu {
                msg: "Failed to fetch organizations",
            })?;
        let res = Self::check(res).await?;
        let orgs = res.json::<Value>().await.context(WreqSnafu {
            msg: "Failed to parse organizations response",
        })?;
        let org = orgs
            .as_array()
            .and_then(|a| {
                a.iter()
                    .filter(|v| {
                        v.get("capabilities")
                            .and_then(|c| c.as_array())
                            .is_some_and(|c| c.iter().any(|c| c.as_str() == Some("chat")))
                    })
                    .max_by_key(|v| {
                        v.get("capabilities")
                            .and_then(|c| c.as_array())
                            .map(|c| c.len())
                            .unwrap_or_default()
                    })
            })
            .ok_or(CloverError::OrganizationInfo {
                reason: "no chat-capable organization".to_string(),
            })?;
        let uuid = org
            .get("uuid")
            .and_then(|u| u.as_str())
            .ok_or(CloverError::OrganizationInfo {
                reason: "organization without uuid".to_string(),
            })?
            .to_string();
        let capabilities = org["capabilities"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|c| c.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        debug!("Resolved organization {uuid}");
        Ok((uuid, capabilities))
    }

    /// Run the PKCE authorize step with a cookie.
    ///
    /// Returns the authorization code (suffixed `#state` when the server
    /// echoes one) together with the PKCE verifier.
    pub async fn authorize_with_cookie(
        &self,
        cookie: &str,
        organization_uuid: &str,
    ) -> Result<(String, String), CloverError> {
        let config = CLOVER_CONFIG.load();
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let state = CsrfToken::new_random_len(32);
        let authorize_url = config
            .oauth_authorize_url
            .replace("{organization_uuid}", organization_uuid);

        let payload = json!({
            "response_type": "code",
            "client_id": config.oauth_client_id,
            "organization_uuid": organization_uuid,
            "redirect_uri": config.oauth_redirect_uri,
            "scope": "user:profile user:inference",
            "state": state.secret(),
            "code_challenge": challenge.as_str(),
            "code_challenge_method": "S256",
        });

        let res = self
            .cookie_request(wreq::Method::POST, authorize_url, cookie)
            .json(&payload)
            .send()
            .await
            .context(WreqSnafu {
                msg: "Failed to send authorization request",
            })?;
        let res = Self::check(res).await?;
        let body = res.json::<Value>().await.context(WreqSnafu {
            msg: "Failed to parse authorization response",
        })?;
        let redirect_uri =
            body["redirect_uri"]
                .as_str()
                .ok_or(CloverError::CookieAuthorization {
                    reason: "no redirect_uri in response".to_string(),
                })?;
        let redirect = Url::parse(redirect_uri).map_err(|_| CloverError::CookieAuthorization {
            reason: format!("malformed redirect_uri: {redirect_uri}"),
        })?;
        let mut code = None;
        let mut echoed_state = None;
        for (k, v) in redirect.query_pairs() {
            match k.as_ref() {
                "code" => code = Some(v.to_string()),
                "state" => echoed_state = Some(v.to_string()),
                _ => {}
            }
        }
        let code = code.ok_or(CloverError::CookieAuthorization {
            reason: "no code in redirect_uri".to_string(),
        })?;
        let full_code = match echoed_state {
            Some(state) => format!("{code}#{state}"),
            None => code,
        };
        Ok((full_code, verifier.secret().to_string()))
    }

    /// Exchange an authorization code (optionally `code#state`) for tokens
    pub async fn exchange_token(
        &self,
        code_with_state: &str,
        verifier: &str,
    ) -> Result<OAuthToken, CloverError> {
        let config = CLOVER_CONFIG.load();
        let (code, state) = match code_with_state.split_once('#') {
            Some((code, state)) => (code, Some(state)),
            None => (code_with_state, None),
        };
        let mut payload = json!({
            "code": code,
            "grant_type": "authorization_code",
            "client_id": config.oauth_client_id,
            "redirect_uri": config.oauth_redirect_uri,
            "code_verifier": verifier,
        });
        if let Some(state) = state {
            payload["state"] = json!(state);
        }
        let res = self
            .client
            .post(config.oauth_token_url.to_owned())
            .json(&payload)
            .timeout(std::time::Duration::from_secs(config.request_timeout))
            .send()
            .await
            .context(WreqSnafu {
                msg: "Failed to send token exchange request",
            })?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CloverError::OAuthExchange {
                reason: format!("token endpoint returned {status}: {body}"),
            });
        }
        let token = res.json::<TokenResponse>().await.context(WreqSnafu {
            msg: "Failed to parse token response",
        })?;
        Ok(token.into())
    }

    /// Rotate an access token with its refresh token
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<OAuthToken, CloverError> {
        let config = CLOVER_CONFIG.load();
        let payload = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": config.oauth_client_id,
        });
        let res = self
            .client
            .post(config.oauth_token_url.to_owned())
            .json(&payload)
            .timeout(std::time::Duration::from_secs(config.request_timeout))
            .send()
            .await
            .context(WreqSnafu {
                msg: "Failed to send token refresh request",
            })?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(CloverError::OAuthExchange {
                reason: format!("refresh returned {status}"),
            });
        }
        let token = res.json::<TokenResponse>().await.context(WreqSnafu {
            msg: "Failed to parse refresh response",
        })?;
        Ok(token.into())
    }

    /// Full cookie-to-token composition: discover the organization,
    /// authorize, exchange
    pub async fn authenticate(
        &self,
        cookie: &str,
    ) -> Result<(String, Vec<String>, OAuthToken), CloverError> {
        let (org_uuid, capabilities) = self.get_organization_info(cookie).await?;
        let (code, verifier) = self.authorize_with_cookie(cookie, &org_uuid).await?;
        let token = self.exchange_token(&code, &verifier).await?;
        info!("OAuth authentication succeeded for {}", &org_uuid[..8.min(org_uuid.len())]);
        Ok((org_uuid, capabilities, token))
    }
}
