//! Configured identity sources.

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    sync::{Arc, RwLock},
};
use url::{Url, form_urlencoded};
use utoipa::ToSchema;

use crate::auth::{
    config::{
        AuthProviderConfig, OAuthAuthProvider, OpenIdConnectAuthProvider, SamlAuthProvider,
        HttpHeaderAuthProvider,
    },
    flow::{IdpClients, oidc::OidcMetadata, saml::SamlIdpMetadata},
};

pub const BUILTIN_TYPE: &str = "builtin";
pub const OIDC_TYPE: &str = "openidconnect";
pub const SAML_TYPE: &str = "saml";
pub const HTTP_HEADER_TYPE: &str = "http-header";

/// Stable, non-secret identifier of a provider instance.
///
/// Derived from the service and client identity unless the configuration
/// pins it with `configID`. It can change when the configuration changes, so
/// it is never used as an account key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct ConfigId {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl ConfigId {
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    fn derive(kind: &str, explicit: Option<&str>, service_id: &str, client_id: &str) -> Self {
        let id = match explicit.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let digest = Sha256::digest(format!("{service_id}\n{client_id}").as_bytes());
                URL_SAFE_NO_PAD.encode(&digest[..12])
            }
        };
        Self::new(kind, id)
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Display and routing data that is safe to hand to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct CachedInfo {
    pub service_id: String,
    pub client_id: String,
    pub display_name: String,
    pub authentication_url: String,
}

/// Code-host families that sign users in with the OAuth2 code flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OAuthServiceType {
    GitHub,
    GitLab,
    BitbucketCloud,
}

impl OAuthServiceType {
    pub const ALL: [Self; 3] = [Self::GitHub, Self::GitLab, Self::BitbucketCloud];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::BitbucketCloud => "bitbucketcloud",
        }
    }

    #[must_use]
    pub fn from_type(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    #[must_use]
    pub const fn default_url(self) -> &'static str {
        match self {
            Self::GitHub => "https://github.com/",
            Self::GitLab => "https://gitlab.com/",
            Self::BitbucketCloud => "https://bitbucket.org/",
        }
    }

    #[must_use]
    pub const fn default_display_name(self) -> &'static str {
        match self {
            Self::GitHub => "GitHub",
            Self::GitLab => "GitLab",
            Self::BitbucketCloud => "Bitbucket Cloud",
        }
    }

    #[must_use]
    pub const fn authorize_path(self) -> &'static str {
        match self {
            Self::GitHub => "login/oauth/authorize",
            Self::GitLab => "oauth/authorize",
            Self::BitbucketCloud => "site/oauth2/authorize",
        }
    }

    #[must_use]
    pub const fn token_path(self) -> &'static str {
        match self {
            Self::GitHub => "login/oauth/access_token",
            Self::GitLab => "oauth/token",
            Self::BitbucketCloud => "site/oauth2/access_token",
        }
    }

    #[must_use]
    pub const fn scopes(self) -> &'static str {
        match self {
            Self::GitHub => "user:email read:org repo",
            Self::GitLab => "read_user read_api",
            Self::BitbucketCloud => "account email repository",
        }
    }
}

/// Lazily populated external metadata (OIDC discovery, SAML IdP metadata).
pub struct MetadataCache<T> {
    value: RwLock<Option<Arc<T>>>,
}

impl<T> MetadataCache<T> {
    fn empty() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        match self.value.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut guard = match self.value.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Arc::clone(&value));
        value
    }
}

pub enum ProviderKind {
    Builtin,
    OAuth(OAuthServiceType),
    Oidc(MetadataCache<OidcMetadata>),
    Saml(MetadataCache<SamlIdpMetadata>),
    HttpHeader,
}

/// A configured identity source.
pub struct Provider {
    config_id: ConfigId,
    info: CachedInfo,
    config: AuthProviderConfig,
    config_json: String,
    kind: ProviderKind,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("config_id", &self.config_id)
            .field("display_name", &self.info.display_name)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Build a provider from one `auth.providers` entry.
    ///
    /// # Errors
    /// Returns an error when the entry is unusable (bad URL, empty client ID).
    pub fn from_config(config: AuthProviderConfig) -> Result<Self> {
        let config_json =
            serde_json::to_string(&config).context("failed to serialize provider config")?;
        let (config_id, info, kind) = match &config {
            AuthProviderConfig::Builtin(_) => (
                ConfigId::new(BUILTIN_TYPE, ""),
                CachedInfo {
                    service_id: String::new(),
                    client_id: String::new(),
                    display_name: "Builtin username-password authentication".to_string(),
                    authentication_url: "/sign-in".to_string(),
                },
                ProviderKind::Builtin,
            ),
            AuthProviderConfig::GitHub(oauth) => oauth_parts(OAuthServiceType::GitHub, oauth)?,
            AuthProviderConfig::GitLab(oauth) => oauth_parts(OAuthServiceType::GitLab, oauth)?,
            AuthProviderConfig::BitbucketCloud(oauth) => {
                oauth_parts(OAuthServiceType::BitbucketCloud, oauth)?
            }
            AuthProviderConfig::OpenIdConnect(oidc) => oidc_parts(oidc)?,
            AuthProviderConfig::Saml(saml) => saml_parts(saml)?,
            AuthProviderConfig::HttpHeader(header) => {
                if header.username_header.trim().is_empty() {
                    return Err(anyhow!("http-header provider requires usernameHeader"));
                }
                (
                    ConfigId::new(HTTP_HEADER_TYPE, ""),
                    CachedInfo {
                        service_id: String::new(),
                        client_id: String::new(),
                        display_name: "HTTP authentication proxy".to_string(),
                        authentication_url: String::new(),
                    },
                    ProviderKind::HttpHeader,
                )
            }
        };
        Ok(Self {
            config_id,
            info,
            config,
            config_json,
            kind,
        })
    }

    #[must_use]
    pub fn config_id(&self) -> &ConfigId {
        &self.config_id
    }

    #[must_use]
    pub fn cached_info(&self) -> &CachedInfo {
        &self.info
    }

    #[must_use]
    pub fn config(&self) -> &AuthProviderConfig {
        &self.config
    }

    /// Secret-bearing serialized configuration, used for de-duplication.
    #[must_use]
    pub fn config_json(&self) -> &str {
        &self.config_json
    }

    #[must_use]
    pub fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    #[must_use]
    pub fn order(&self) -> Option<i32> {
        match &self.config {
            AuthProviderConfig::GitHub(oauth)
            | AuthProviderConfig::GitLab(oauth)
            | AuthProviderConfig::BitbucketCloud(oauth) => oauth.order,
            AuthProviderConfig::OpenIdConnect(oidc) => oidc.order,
            AuthProviderConfig::Saml(saml) => saml.order,
            AuthProviderConfig::Builtin(_) | AuthProviderConfig::HttpHeader(_) => None,
        }
    }

    #[must_use]
    pub fn allow_signup(&self) -> bool {
        match &self.config {
            AuthProviderConfig::Builtin(builtin) => builtin.allow_signup,
            AuthProviderConfig::GitHub(oauth)
            | AuthProviderConfig::GitLab(oauth)
            | AuthProviderConfig::BitbucketCloud(oauth) => oauth.allow_signup,
            AuthProviderConfig::OpenIdConnect(oidc) => oidc.allow_signup,
            AuthProviderConfig::Saml(saml) => saml.allow_signup,
            AuthProviderConfig::HttpHeader(_) => true,
        }
    }

    #[must_use]
    pub const fn is_builtin(&self) -> bool {
        matches!(self.kind, ProviderKind::Builtin)
    }

    /// Browser single-sign-on capable (OAuth, OIDC or SAML).
    #[must_use]
    pub const fn is_sso(&self) -> bool {
        matches!(
            self.kind,
            ProviderKind::OAuth(_) | ProviderKind::Oidc(_) | ProviderKind::Saml(_)
        )
    }

    #[must_use]
    pub fn oauth(&self) -> Option<(OAuthServiceType, &OAuthAuthProvider)> {
        match (&self.kind, &self.config) {
            (
                ProviderKind::OAuth(service_type),
                AuthProviderConfig::GitHub(oauth)
                | AuthProviderConfig::GitLab(oauth)
                | AuthProviderConfig::BitbucketCloud(oauth),
            ) => Some((*service_type, oauth)),
            _ => None,
        }
    }

    #[must_use]
    pub fn oidc(&self) -> Option<(&OpenIdConnectAuthProvider, &MetadataCache<OidcMetadata>)> {
        match (&self.kind, &self.config) {
            (ProviderKind::Oidc(cache), AuthProviderConfig::OpenIdConnect(oidc)) => {
                Some((oidc, cache))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn saml(&self) -> Option<(&SamlAuthProvider, &MetadataCache<SamlIdpMetadata>)> {
        match (&self.kind, &self.config) {
            (ProviderKind::Saml(cache), AuthProviderConfig::Saml(saml)) => Some((saml, cache)),
            _ => None,
        }
    }

    #[must_use]
    pub fn http_header(&self) -> Option<&HttpHeaderAuthProvider> {
        match &self.config {
            AuthProviderConfig::HttpHeader(header) => Some(header),
            _ => None,
        }
    }

    /// Fetch external metadata (OIDC discovery and keys, SAML IdP metadata).
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be fetched or parsed.
    pub async fn refresh(&self, clients: &IdpClients) -> Result<()> {
        if let Some((oidc, cache)) = self.oidc() {
            let metadata = crate::auth::flow::oidc::fetch_metadata(clients, &oidc.issuer)
                .await
                .with_context(|| format!("failed to refresh OpenID Connect provider {}", self.config_id))?;
            cache.set(metadata);
        } else if let Some((saml, cache)) = self.saml() {
            let metadata = clients
                .saml
                .fetch_idp_metadata(saml)
                .await
                .with_context(|| format!("failed to refresh SAML provider {}", self.config_id))?;
            cache.set(metadata);
        }
        Ok(())
    }
}

fn login_url(kind: &str, id: &str) -> String {
    let id: String = form_urlencoded::byte_serialize(id.as_bytes()).collect();
    format!("/.auth/{kind}/login?pc={id}")
}

/// Normalize a base URL so it always ends with a slash.
fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid URL: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("unsupported URL scheme: {}", url.scheme()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn oauth_parts(
    service_type: OAuthServiceType,
    config: &OAuthAuthProvider,
) -> Result<(ConfigId, CachedInfo, ProviderKind)> {
    if config.client_id.is_empty() {
        return Err(anyhow!("{} provider requires clientID", service_type.as_str()));
    }
    let base = normalize_base_url(
        config
            .url
            .as_deref()
            .unwrap_or_else(|| service_type.default_url()),
    )?;
    let service_id = base.to_string();
    let config_id = ConfigId::derive(
        service_type.as_str(),
        config.config_id.as_deref(),
        &service_id,
        &config.client_id,
    );
    let info = CachedInfo {
        authentication_url: login_url(service_type.as_str(), &config_id.id),
        service_id,
        client_id: config.client_id.clone(),
        display_name: config
            .display_name
            .clone()
            .unwrap_or_else(|| service_type.default_display_name().to_string()),
    };
    Ok((config_id, info, ProviderKind::OAuth(service_type)))
}

fn oidc_parts(config: &OpenIdConnectAuthProvider) -> Result<(ConfigId, CachedInfo, ProviderKind)> {
    if config.issuer.trim().is_empty() {
        return Err(anyhow!("openidconnect provider requires issuer"));
    }
    if config.client_id.is_empty() {
        return Err(anyhow!("openidconnect provider requires clientID"));
    }
    Url::parse(&config.issuer).with_context(|| format!("invalid issuer URL: {}", config.issuer))?;
    let config_id = ConfigId::derive(
        OIDC_TYPE,
        config.config_id.as_deref(),
        &config.issuer,
        &config.client_id,
    );
    let info = CachedInfo {
        authentication_url: login_url(OIDC_TYPE, &config_id.id),
        service_id: config.issuer.clone(),
        client_id: config.client_id.clone(),
        display_name: config
            .display_name
            .clone()
            .unwrap_or_else(|| "OpenID Connect".to_string()),
    };
    Ok((config_id, info, ProviderKind::Oidc(MetadataCache::empty())))
}

fn saml_parts(config: &SamlAuthProvider) -> Result<(ConfigId, CachedInfo, ProviderKind)> {
    let service_id = match (
        &config.identity_provider_metadata_url,
        &config.identity_provider_metadata,
    ) {
        (Some(url), _) => {
            Url::parse(url).with_context(|| format!("invalid IdP metadata URL: {url}"))?;
            url.clone()
        }
        (None, Some(inline)) => {
            let digest = Sha256::digest(inline.as_bytes());
            format!("inline:{}", URL_SAFE_NO_PAD.encode(&digest[..12]))
        }
        (None, None) => {
            return Err(anyhow!(
                "saml provider requires identityProviderMetadataURL or identityProviderMetadata"
            ));
        }
    };
    let client_id = config.service_provider_issuer.clone().unwrap_or_default();
    let config_id = ConfigId::derive(
        SAML_TYPE,
        config.config_id.as_deref(),
        &service_id,
        &client_id,
    );
    let info = CachedInfo {
        authentication_url: login_url(SAML_TYPE, &config_id.id),
        service_id,
        client_id,
        display_name: config
            .display_name
            .clone()
            .unwrap_or_else(|| "SAML".to_string()),
    };
    Ok((config_id, info, ProviderKind::Saml(MetadataCache::empty())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::config::BuiltinAuthProvider;

    fn github(client_id: &str) -> AuthProviderConfig {
        AuthProviderConfig::GitHub(OAuthAuthProvider {
            url: None,
            client_id: client_id.to_string(),
            client_secret: "secret".to_string(),
            display_name: None,
            order: None,
            allow_signup: true,
            config_id: None,
        })
    }

    #[test]
    fn oauth_config_id_is_stable_and_non_secret() -> Result<()> {
        let first = Provider::from_config(github("client-a"))?;
        let second = Provider::from_config(github("client-a"))?;
        let other = Provider::from_config(github("client-b"))?;

        assert_eq!(first.config_id(), second.config_id());
        assert_ne!(first.config_id(), other.config_id());
        assert_eq!(first.config_id().kind, "github");
        assert!(!first.config_id().id.contains("secret"));
        assert_eq!(first.cached_info().service_id, "https://github.com/");
        assert_eq!(
            first.cached_info().authentication_url,
            format!("/.auth/github/login?pc={}", first.config_id().id)
        );
        Ok(())
    }

    #[test]
    fn explicit_config_id_wins() -> Result<()> {
        let config = AuthProviderConfig::GitLab(OAuthAuthProvider {
            url: Some("https://gitlab.example.com".to_string()),
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
            display_name: Some("Company GitLab".to_string()),
            order: Some(1),
            allow_signup: false,
            config_id: Some("corp gitlab".to_string()),
        });
        let provider = Provider::from_config(config)?;
        assert_eq!(provider.config_id(), &ConfigId::new("gitlab", "corp gitlab"));
        assert_eq!(
            provider.cached_info().authentication_url,
            "/.auth/gitlab/login?pc=corp+gitlab"
        );
        assert_eq!(provider.cached_info().service_id, "https://gitlab.example.com/");
        assert_eq!(provider.order(), Some(1));
        assert!(!provider.allow_signup());
        assert!(provider.is_sso());
        Ok(())
    }

    #[test]
    fn builtin_provider_shape() -> Result<()> {
        let provider =
            Provider::from_config(AuthProviderConfig::Builtin(BuiltinAuthProvider::default()))?;
        assert!(provider.is_builtin());
        assert!(!provider.is_sso());
        assert_eq!(provider.config_id(), &ConfigId::new("builtin", ""));
        Ok(())
    }

    #[test]
    fn rejects_incomplete_configs() {
        assert!(Provider::from_config(github("")).is_err());
        let oidc = AuthProviderConfig::OpenIdConnect(OpenIdConnectAuthProvider {
            issuer: String::new(),
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
            display_name: None,
            order: None,
            allow_signup: true,
            config_id: None,
            service_type: None,
        });
        assert!(Provider::from_config(oidc).is_err());
        let saml = AuthProviderConfig::Saml(SamlAuthProvider {
            identity_provider_metadata_url: None,
            identity_provider_metadata: None,
            service_provider_issuer: None,
            display_name: None,
            order: None,
            allow_signup: true,
            config_id: None,
            username_attribute_names: Vec::new(),
        });
        assert!(Provider::from_config(saml).is_err());
    }

    #[test]
    fn metadata_cache_starts_empty() -> Result<()> {
        let provider = Provider::from_config(AuthProviderConfig::OpenIdConnect(
            OpenIdConnectAuthProvider {
                issuer: "https://id.example.com".to_string(),
                client_id: "c".to_string(),
                client_secret: "s".to_string(),
                display_name: None,
                order: None,
                allow_signup: true,
                config_id: None,
                service_type: None,
            },
        ))?;
        let cached = provider.oidc().map(|(_, cache)| cache.get().is_none());
        assert_eq!(cached, Some(true));
        Ok(())
    }
}
