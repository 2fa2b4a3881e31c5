//! Outbound HTTP to identity providers.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::{fmt, time::Duration};
use tracing::debug;

use crate::APP_USER_AGENT;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Authorization-code exchange request.
#[derive(Clone)]
pub struct TokenRequest {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub code: String,
    pub redirect_uri: String,
}

impl fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRequest")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait OAuthTransport: Send + Sync {
    async fn exchange_code(&self, request: &TokenRequest) -> Result<TokenResponse>;

    async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<Value>;

    async fn get_text(&self, url: &str) -> Result<String>;
}

/// `reqwest`-backed transport.
///
/// With `debug` on, request and response metadata are logged at debug level.
/// Bodies and tokens are never logged.
pub struct HttpTransport {
    client: reqwest::Client,
    debug: bool,
}

impl HttpTransport {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(debug: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, debug })
    }

    fn trace(&self, method: &str, url: &str, status: reqwest::StatusCode) {
        if self.debug {
            debug!(method, url, status = status.as_u16(), "identity provider request");
        }
    }
}

#[async_trait]
impl OAuthTransport for HttpTransport {
    async fn exchange_code(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", request.code.as_str()),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("client_id", request.client_id.as_str()),
            ("client_secret", request.client_secret.as_str()),
        ];
        let response = self
            .client
            .post(&request.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .context("token request failed")?;
        self.trace("POST", &request.token_url, response.status());
        if !response.status().is_success() {
            return Err(anyhow!("token endpoint returned {}", response.status()));
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("failed to decode token response")?;
        if token.access_token.is_empty() {
            return Err(anyhow!("token endpoint returned no access token"));
        }
        Ok(token)
    }

    async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<Value> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("request failed")?;
        self.trace("GET", url, response.status());
        if !response.status().is_success() {
            return Err(anyhow!("{url} returned {}", response.status()));
        }
        response.json().await.context("failed to decode JSON response")
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await.context("request failed")?;
        self.trace("GET", url, response.status());
        if !response.status().is_success() {
            return Err(anyhow!("{url} returned {}", response.status()));
        }
        response.text().await.context("failed to read response body")
    }
}
