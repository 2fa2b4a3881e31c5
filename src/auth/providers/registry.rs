//! Registry of the active providers.
//!
//! Each configuration watcher owns the subset of providers it registered
//! under its source key. Writers swap in a new snapshot (copy-on-write), so
//! readers never see a half-applied update. Reads block until every expected
//! watcher has reported at least once, which keeps early requests from
//! running against an empty provider set.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};
use tokio::sync::watch;
use tracing::{debug, info};

use super::provider::{ConfigId, Provider};

type Snapshot = HashMap<String, HashMap<String, Arc<Provider>>>;

pub struct ProviderRegistry {
    providers: RwLock<Arc<Snapshot>>,
    mock: RwLock<Option<Vec<Arc<Provider>>>>,
    pending: Mutex<HashSet<String>>,
    ready: watch::Sender<bool>,
}

impl ProviderRegistry {
    /// Registry whose reads wait until every source in `expected_sources`
    /// has called [`ProviderRegistry::update`] at least once.
    #[must_use]
    pub fn new<I, S>(expected_sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pending: HashSet<String> = expected_sources.into_iter().map(Into::into).collect();
        let (ready, _rx) = watch::channel(pending.is_empty());
        Self {
            providers: RwLock::new(Arc::new(HashMap::new())),
            mock: RwLock::new(None),
            pending: Mutex::new(pending),
            ready,
        }
    }

    /// Registry with the readiness gate already open, for tests and
    /// short-lived processes.
    #[must_use]
    pub fn ready() -> Self {
        Self::new(std::iter::empty::<String>())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for the initial registration to complete.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Replace the providers owned by `source`. `None` drops the source's
    /// contribution entirely.
    ///
    /// Providers are de-duplicated by their serialized configuration; an
    /// unchanged entry keeps its existing instance (and cached metadata).
    /// Returns the providers that were not registered before.
    pub fn update(&self, source: &str, providers: Option<Vec<Provider>>) -> Vec<Arc<Provider>> {
        let mut added = Vec::new();
        {
            let mut guard = match self.providers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut next: Snapshot = (**guard).clone();
            let previous = next.remove(source).unwrap_or_default();
            if let Some(providers) = providers {
                let mut owned = HashMap::with_capacity(providers.len());
                for provider in providers {
                    let key = provider.config_json().to_string();
                    if owned.contains_key(&key) {
                        continue;
                    }
                    let provider = match previous.get(&key) {
                        Some(existing) => Arc::clone(existing),
                        None => {
                            let provider = Arc::new(provider);
                            added.push(Arc::clone(&provider));
                            provider
                        }
                    };
                    owned.insert(key, provider);
                }
                if !owned.is_empty() {
                    next.insert(source.to_string(), owned);
                }
            }
            *guard = Arc::new(next);
        }
        debug!(source, added = added.len(), "provider registry updated");
        self.mark_reported(source);
        added
    }

    fn mark_reported(&self, source: &str) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending.remove(source) && pending.is_empty() {
            info!("initial authentication provider registration complete");
            self.ready.send_replace(true);
        }
    }

    /// Replace live behavior with a fixed provider list (`None` restores it).
    pub fn mock_providers(&self, providers: Option<Vec<Provider>>) {
        let mut guard = match self.mock.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = providers.map(|providers| providers.into_iter().map(Arc::new).collect());
    }

    fn mocked(&self) -> Option<Vec<Arc<Provider>>> {
        match self.mock.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// All registered providers, in no particular order.
    pub async fn providers(&self) -> Vec<Arc<Provider>> {
        if let Some(mocked) = self.mocked() {
            return mocked;
        }
        self.wait_ready().await;
        let snapshot = match self.providers.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        };
        snapshot
            .values()
            .flat_map(|owned| owned.values().cloned())
            .collect()
    }

    /// Providers in display order: builtin first, then by explicit `order`,
    /// unordered after ordered, ties broken by `(type, id)`.
    pub async fn sorted_providers(&self) -> Vec<Arc<Provider>> {
        let mut providers = self.providers().await;
        providers.sort_by(|a, b| compare_providers(a, b));
        providers
    }

    pub async fn get_provider_by_config_id(&self, id: &ConfigId) -> Option<Arc<Provider>> {
        self.providers()
            .await
            .into_iter()
            .find(|provider| provider.config_id() == id)
    }

    /// First provider (in display order) of the given type.
    pub async fn get_provider_by_service_type(&self, kind: &str) -> Option<Arc<Provider>> {
        self.sorted_providers()
            .await
            .into_iter()
            .find(|provider| provider.config_id().kind == kind)
    }
}

fn compare_providers(a: &Provider, b: &Provider) -> Ordering {
    match (a.is_builtin(), b.is_builtin()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (a.order(), b.order()) {
        (Some(left), Some(right)) if left != right => return left.cmp(&right),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => {}
    }
    a.config_id().cmp(b.config_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::config::{AuthProviderConfig, BuiltinAuthProvider, OAuthAuthProvider};
    use anyhow::Result;
    use std::time::Duration;

    fn oauth(kind: &str, client_id: &str, order: Option<i32>) -> Result<Provider> {
        let config = OAuthAuthProvider {
            url: None,
            client_id: client_id.to_string(),
            client_secret: "secret".to_string(),
            display_name: None,
            order,
            allow_signup: true,
            config_id: Some(client_id.to_string()),
        };
        let config = match kind {
            "gitlab" => AuthProviderConfig::GitLab(config),
            "bitbucketcloud" => AuthProviderConfig::BitbucketCloud(config),
            _ => AuthProviderConfig::GitHub(config),
        };
        Provider::from_config(config)
    }

    fn builtin() -> Result<Provider> {
        Provider::from_config(AuthProviderConfig::Builtin(BuiltinAuthProvider::default()))
    }

    fn ids(providers: &[Arc<Provider>]) -> Vec<String> {
        providers
            .iter()
            .map(|provider| provider.config_id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn removing_a_source_drops_its_providers() -> Result<()> {
        let registry = ProviderRegistry::ready();
        registry.update("pkgA", Some(vec![oauth("github", "p1", None)?]));
        assert_eq!(registry.providers().await.len(), 1);

        registry.update("pkgA", None);
        assert!(registry.providers().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sources_do_not_clobber_each_other() -> Result<()> {
        let registry = ProviderRegistry::ready();
        registry.update("pkgA", Some(vec![oauth("github", "p1", None)?]));
        registry.update("pkgB", Some(vec![oauth("gitlab", "p2", None)?]));

        let mut got = ids(&registry.providers().await);
        got.sort();
        assert_eq!(got, vec!["github:p1".to_string(), "gitlab:p2".to_string()]);

        registry.update("pkgA", Some(vec![oauth("github", "p3", None)?]));
        let mut got = ids(&registry.providers().await);
        got.sort();
        assert_eq!(got, vec!["github:p3".to_string(), "gitlab:p2".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_configs_register_once_and_keep_instance() -> Result<()> {
        let registry = ProviderRegistry::ready();
        let added = registry.update(
            "pkgA",
            Some(vec![oauth("github", "p1", None)?, oauth("github", "p1", None)?]),
        );
        assert_eq!(added.len(), 1);
        assert_eq!(registry.providers().await.len(), 1);

        let before = registry.providers().await;
        let added = registry.update("pkgA", Some(vec![oauth("github", "p1", None)?]));
        assert!(added.is_empty());
        let after = registry.providers().await;
        assert!(Arc::ptr_eq(&before[0], &after[0]));
        Ok(())
    }

    #[tokio::test]
    async fn sorted_providers_ordering() -> Result<()> {
        let registry = ProviderRegistry::ready();
        registry.update(
            "oauth",
            Some(vec![
                oauth("gitlab", "z-unordered", None)?,
                oauth("github", "b-unordered", None)?,
                oauth("github", "second", Some(2))?,
                oauth("gitlab", "first", Some(1))?,
            ]),
        );
        registry.update("builtin", Some(vec![builtin()?]));

        let sorted = ids(&registry.sorted_providers().await);
        assert_eq!(
            sorted,
            vec![
                "builtin:".to_string(),
                "gitlab:first".to_string(),
                "github:second".to_string(),
                "github:b-unordered".to_string(),
                "gitlab:z-unordered".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn reads_block_until_every_source_reported() -> Result<()> {
        let registry = Arc::new(ProviderRegistry::new(["builtin", "oauth"]));
        assert!(!registry.is_ready());

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.providers().await.len() })
        };

        registry.update("builtin", Some(vec![builtin()?]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        assert!(!registry.is_ready());

        registry.update("oauth", None);
        let count = tokio::time::timeout(Duration::from_secs(1), reader).await??;
        assert_eq!(count, 1);
        assert!(registry.is_ready());
        Ok(())
    }

    #[tokio::test]
    async fn mock_overrides_live_providers() -> Result<()> {
        let registry = ProviderRegistry::new(["never-reports"]);
        registry.mock_providers(Some(vec![oauth("github", "mocked", None)?]));
        assert_eq!(ids(&registry.providers().await), vec!["github:mocked".to_string()]);

        let found = registry
            .get_provider_by_config_id(&ConfigId::new("github", "mocked"))
            .await;
        assert!(found.is_some());
        let by_type = registry.get_provider_by_service_type("github").await;
        assert!(by_type.is_some());
        Ok(())
    }
}
