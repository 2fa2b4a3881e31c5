//! Site configuration relevant to authentication and its change feed.
//!
//! The site configuration is a JSON document. Provider families subscribe to
//! [`SiteConfigSource`] and translate each new revision into a provider set.

use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, sync::Arc, time::SystemTime};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SiteConfig {
    #[serde(rename = "auth.providers", default)]
    pub auth_providers: Vec<AuthProviderConfig>,
    /// Allow anonymous access to the whole instance.
    #[serde(rename = "auth.public", default)]
    pub auth_public: bool,
    /// Session lifetime such as `"720h"` or `"30d"`.
    #[serde(rename = "auth.sessionExpiry", default)]
    pub auth_session_expiry: Option<String>,
}

impl SiteConfig {
    /// Parse a site configuration document.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or a provider entry is unknown.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid site configuration")
    }

    /// Configured session lifetime, if set and parseable.
    #[must_use]
    pub fn session_expiry(&self) -> Option<Duration> {
        self.auth_session_expiry.as_deref().and_then(parse_duration)
    }
}

/// Longest accepted session lifetime.
const MAX_SESSION_EXPIRY_DAYS: i64 = 3650;

/// Parse `<integer><unit>` with unit `s`, `m`, `h` or `d`.
///
/// Lifetimes above ten years are rejected.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    if amount <= 0 {
        return None;
    }
    let duration = match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => None,
    }?;
    (duration <= Duration::try_days(MAX_SESSION_EXPIRY_DAYS)?).then_some(duration)
}

/// One entry of `auth.providers`, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthProviderConfig {
    #[serde(rename = "builtin")]
    Builtin(BuiltinAuthProvider),
    #[serde(rename = "github")]
    GitHub(OAuthAuthProvider),
    #[serde(rename = "gitlab")]
    GitLab(OAuthAuthProvider),
    #[serde(rename = "bitbucketcloud")]
    BitbucketCloud(OAuthAuthProvider),
    #[serde(rename = "openidconnect")]
    OpenIdConnect(OpenIdConnectAuthProvider),
    #[serde(rename = "saml")]
    Saml(SamlAuthProvider),
    #[serde(rename = "http-header")]
    HttpHeader(HttpHeaderAuthProvider),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltinAuthProvider {
    #[serde(default)]
    pub allow_signup: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthAuthProvider {
    /// Base URL of the code host. Defaults per service type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(rename = "allowSignup", default = "default_true")]
    pub allow_signup: bool,
    #[serde(rename = "configID", default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
}

impl fmt::Debug for OAuthAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthAuthProvider")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("display_name", &self.display_name)
            .field("order", &self.order)
            .field("allow_signup", &self.allow_signup)
            .field("config_id", &self.config_id)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdConnectAuthProvider {
    pub issuer: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(rename = "allowSignup", default = "default_true")]
    pub allow_signup: bool,
    #[serde(rename = "configID", default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    /// Overrides the external-account service type, e.g. for the operator provider.
    #[serde(rename = "serviceType", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

impl fmt::Debug for OpenIdConnectAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenIdConnectAuthProvider")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("display_name", &self.display_name)
            .field("order", &self.order)
            .field("allow_signup", &self.allow_signup)
            .field("config_id", &self.config_id)
            .field("service_type", &self.service_type)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlAuthProvider {
    #[serde(rename = "identityProviderMetadataURL", default, skip_serializing_if = "Option::is_none")]
    pub identity_provider_metadata_url: Option<String>,
    /// Inline IdP metadata XML, used instead of fetching the URL.
    #[serde(rename = "identityProviderMetadata", default, skip_serializing_if = "Option::is_none")]
    pub identity_provider_metadata: Option<String>,
    #[serde(rename = "serviceProviderIssuer", default, skip_serializing_if = "Option::is_none")]
    pub service_provider_issuer: Option<String>,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(rename = "allowSignup", default = "default_true")]
    pub allow_signup: bool,
    #[serde(rename = "configID", default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    #[serde(rename = "usernameAttributeNames", default, skip_serializing_if = "Vec::is_empty")]
    pub username_attribute_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaderAuthProvider {
    #[serde(rename = "usernameHeader")]
    pub username_header: String,
    #[serde(rename = "emailHeader", default, skip_serializing_if = "Option::is_none")]
    pub email_header: Option<String>,
    #[serde(rename = "stripUsernameHeaderPrefix", default, skip_serializing_if = "Option::is_none")]
    pub strip_username_header_prefix: Option<String>,
}

const fn default_true() -> bool {
    true
}

/// Change feed for the site configuration.
///
/// Subscribers always see the latest revision; intermediate revisions may be
/// skipped when several changes land before a subscriber wakes up.
pub struct SiteConfigSource {
    tx: watch::Sender<Arc<SiteConfig>>,
}

impl SiteConfigSource {
    #[must_use]
    pub fn new(initial: SiteConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    #[must_use]
    pub fn current(&self) -> Arc<SiteConfig> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<SiteConfig>> {
        self.tx.subscribe()
    }

    /// Publish `config` if it differs from the current revision.
    /// Returns whether subscribers were notified.
    pub fn replace(&self, config: SiteConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == config {
                false
            } else {
                *current = Arc::new(config);
                true
            }
        })
    }

    /// Read a site configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(path: &PathBuf) -> Result<SiteConfig> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read site configuration: {}", path.display()))?;
        SiteConfig::from_json(&json)
    }

    /// Poll `path` every `interval` and publish changed revisions.
    ///
    /// A file that fails to parse is logged and ignored; the previous
    /// revision stays in effect.
    pub fn spawn_file_poller(
        self: &Arc<Self>,
        path: PathBuf,
        interval: std::time::Duration,
    ) -> JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_modified = modified_at(&path).ok();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let modified = match modified_at(&path) {
                    Ok(modified) => modified,
                    Err(err) => {
                        error!("Failed to stat site configuration: {err:#}");
                        continue;
                    }
                };
                if last_modified == Some(modified) {
                    continue;
                }
                last_modified = Some(modified);
                match Self::load_file(&path) {
                    Ok(config) => {
                        if source.replace(config) {
                            info!(path = %path.display(), "site configuration reloaded");
                        } else {
                            debug!("site configuration unchanged");
                        }
                    }
                    Err(err) => error!("Ignoring invalid site configuration: {err:#}"),
                }
            }
        })
    }
}

impl Default for SiteConfigSource {
    fn default() -> Self {
        Self::new(SiteConfig::default())
    }
}

fn modified_at(path: &PathBuf) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|err| anyhow!("{}: {err}", path.display()))
}
