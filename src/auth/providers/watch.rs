//! Site configuration to provider-set translation.
//!
//! Every provider family has a pure `apply` function from a site
//! configuration to the providers it contributes. A watcher task per family
//! feeds each new revision through it into the registry under the family's
//! source key.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::{
    provider::{Provider, BUILTIN_TYPE, HTTP_HEADER_TYPE, OIDC_TYPE, SAML_TYPE},
    registry::ProviderRegistry,
};
use crate::auth::{
    config::{AuthProviderConfig, SiteConfig, SiteConfigSource},
    external::{Feature, Licensing},
    flow::IdpClients,
};

pub type ApplyFn = fn(&SiteConfig) -> Option<Vec<Provider>>;

/// Registry source key used by the OAuth code-host family.
pub const OAUTH_SOURCE: &str = "oauth";

/// Every watcher the registry waits for before serving reads.
pub const SOURCES: [(&str, ApplyFn); 5] = [
    (BUILTIN_TYPE, apply_builtin),
    (OAUTH_SOURCE, apply_oauth),
    (OIDC_TYPE, apply_openidconnect),
    (SAML_TYPE, apply_saml),
    (HTTP_HEADER_TYPE, apply_http_header),
];

/// Source keys to hand to [`ProviderRegistry::new`].
#[must_use]
pub fn expected_sources() -> Vec<&'static str> {
    SOURCES.iter().map(|(key, _)| *key).collect()
}

fn collect<F>(config: &SiteConfig, select: F) -> Option<Vec<Provider>>
where
    F: Fn(&AuthProviderConfig) -> bool,
{
    let providers: Vec<Provider> = config
        .auth_providers
        .iter()
        .filter(|entry| select(entry))
        .filter_map(|entry| match Provider::from_config(entry.clone()) {
            Ok(provider) => Some(provider),
            Err(err) => {
                error!("Ignoring invalid auth provider configuration: {err:#}");
                None
            }
        })
        .collect();
    if providers.is_empty() {
        None
    } else {
        Some(providers)
    }
}

#[must_use]
pub fn apply_builtin(config: &SiteConfig) -> Option<Vec<Provider>> {
    let mut providers = collect(config, |entry| {
        matches!(entry, AuthProviderConfig::Builtin(_))
    })?;
    if providers.len() > 1 {
        warn!("Multiple builtin auth providers configured; only the first is used");
        providers.truncate(1);
    }
    Some(providers)
}

#[must_use]
pub fn apply_oauth(config: &SiteConfig) -> Option<Vec<Provider>> {
    collect(config, |entry| {
        matches!(
            entry,
            AuthProviderConfig::GitHub(_)
                | AuthProviderConfig::GitLab(_)
                | AuthProviderConfig::BitbucketCloud(_)
        )
    })
}

#[must_use]
pub fn apply_openidconnect(config: &SiteConfig) -> Option<Vec<Provider>> {
    collect(config, |entry| {
        matches!(entry, AuthProviderConfig::OpenIdConnect(_))
    })
}

#[must_use]
pub fn apply_saml(config: &SiteConfig) -> Option<Vec<Provider>> {
    collect(config, |entry| matches!(entry, AuthProviderConfig::Saml(_)))
}

#[must_use]
pub fn apply_http_header(config: &SiteConfig) -> Option<Vec<Provider>> {
    let mut providers = collect(config, |entry| {
        matches!(entry, AuthProviderConfig::HttpHeader(_))
    })?;
    if providers.len() > 1 {
        warn!("Multiple http-header auth providers configured; only the first is used");
        providers.truncate(1);
    }
    Some(providers)
}

/// Collaborators a watcher needs besides the configuration itself.
#[derive(Clone)]
pub struct WatchContext {
    pub registry: Arc<ProviderRegistry>,
    pub clients: Arc<IdpClients>,
    pub licensing: Arc<dyn Licensing>,
}

/// Apply one configuration revision for one source and kick off metadata
/// refreshes for newly registered providers.
pub fn apply_revision(context: &WatchContext, source: &str, apply: ApplyFn, config: &SiteConfig) {
    let providers = apply(config).map(|mut providers| {
        let licensed = context.licensing.check_feature(Feature::Sso);
        providers.retain(|provider| {
            let needs_license = provider.oidc().is_some() || provider.saml().is_some();
            if needs_license && !licensed {
                warn!(
                    provider = %provider.config_id(),
                    "Single sign-on is not licensed; provider ignored"
                );
                return false;
            }
            true
        });
        providers
    });

    for provider in context.registry.update(source, providers) {
        if provider.oidc().is_none() && provider.saml().is_none() {
            continue;
        }
        let clients = Arc::clone(&context.clients);
        tokio::spawn(async move {
            if let Err(err) = provider.refresh(&clients).await {
                warn!("Provider metadata refresh failed; will retry on first login: {err:#}");
            }
        });
    }
}

/// Feed every revision of the site configuration through `apply` into the
/// registry under `source`, starting with the current one.
pub fn watch_providers(
    context: &WatchContext,
    site: &Arc<SiteConfigSource>,
    source: &'static str,
    apply: ApplyFn,
) -> JoinHandle<()> {
    let context = context.clone();
    let mut rx = site.subscribe();
    tokio::spawn(async move {
        loop {
            let config = rx.borrow_and_update().clone();
            apply_revision(&context, source, apply, &config);
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Spawn one watcher task per provider family.
#[must_use]
pub fn spawn_watchers(context: &WatchContext, site: &Arc<SiteConfigSource>) -> Vec<JoinHandle<()>> {
    SOURCES
        .iter()
        .map(|&(source, apply)| watch_providers(context, site, source, apply))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::external::AllowAllLicensing;
    use anyhow::Result;
    use std::time::Duration;

    struct NoSso;

    impl Licensing for NoSso {
        fn check_feature(&self, _feature: Feature) -> bool {
            false
        }
    }

    const SITE: &str = r#"{
        "auth.providers": [
            { "type": "builtin" },
            { "type": "github", "clientID": "a", "clientSecret": "s" },
            { "type": "gitlab", "clientID": "b", "clientSecret": "s" },
            { "type": "github", "clientID": "", "clientSecret": "s" },
            { "type": "saml", "identityProviderMetadata": "<EntityDescriptor/>" }
        ]
    }"#;

    fn context(licensing: Arc<dyn Licensing>) -> WatchContext {
        WatchContext {
            registry: Arc::new(ProviderRegistry::new(expected_sources())),
            clients: Arc::new(IdpClients::for_tests()),
            licensing,
        }
    }

    #[test]
    fn apply_functions_partition_by_family() -> Result<()> {
        let config = SiteConfig::from_json(SITE)?;
        assert_eq!(apply_builtin(&config).map(|p| p.len()), Some(1));
        // The entry with an empty client ID is skipped.
        assert_eq!(apply_oauth(&config).map(|p| p.len()), Some(2));
        assert!(apply_openidconnect(&config).is_none());
        assert_eq!(apply_saml(&config).map(|p| p.len()), Some(1));
        assert!(apply_http_header(&config).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unlicensed_sso_providers_are_dropped() -> Result<()> {
        let context = context(Arc::new(NoSso));
        let config = SiteConfig::from_json(SITE)?;
        for (source, apply) in SOURCES {
            apply_revision(&context, source, apply, &config);
        }
        let providers = context.registry.providers().await;
        assert_eq!(providers.len(), 3);
        assert!(providers.iter().all(|provider| provider.saml().is_none()));
        Ok(())
    }

    #[tokio::test]
    async fn watchers_follow_configuration_changes() -> Result<()> {
        let context = context(Arc::new(AllowAllLicensing));
        let site = Arc::new(SiteConfigSource::new(SiteConfig::from_json(
            r#"{"auth.providers":[{"type":"builtin"}]}"#,
        )?));
        let handles = spawn_watchers(&context, &site);

        let providers = tokio::time::timeout(
            Duration::from_secs(1),
            context.registry.providers(),
        )
        .await?;
        assert_eq!(providers.len(), 1);

        site.replace(SiteConfig::from_json(
            r#"{"auth.providers":[{"type":"builtin"},{"type":"github","clientID":"a","clientSecret":"s"}]}"#,
        )?);
        let mut count = 0;
        for _ in 0..50 {
            count = context.registry.providers().await.len();
            if count == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 2);

        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}
