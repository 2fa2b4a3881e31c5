//! Shared authentication state and its configuration.

use chrono::Duration;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use super::{
    config::SiteConfigSource,
    external::{
        AllowAllLicensing, EventLogger, Licensing, LogEventLogger, LogPermissionSyncer,
        PermissionSyncer, SecurityEvent,
    },
    flow::IdpClients,
    identity::UserStore,
    providers::ProviderRegistry,
    session::SessionStore,
};

const DEFAULT_SESSION_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_OPERATOR_SERVICE_TYPE: &str = "portiere-operator";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    external_url: Url,
    session_ttl_seconds: i64,
    operator_service_type: String,
    insecure_oauth_debug: bool,
}

impl AuthConfig {
    #[must_use]
    pub fn new(external_url: Url) -> Self {
        Self {
            external_url,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            operator_service_type: DEFAULT_OPERATOR_SERVICE_TYPE.to_string(),
            insecure_oauth_debug: false,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_operator_service_type(mut self, service_type: String) -> Self {
        self.operator_service_type = service_type;
        self
    }

    /// Log request and response metadata of identity provider calls.
    #[must_use]
    pub fn with_insecure_oauth_debug(mut self, enabled: bool) -> Self {
        self.insecure_oauth_debug = enabled;
        self
    }

    #[must_use]
    pub fn external_url(&self) -> &Url {
        &self.external_url
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn operator_service_type(&self) -> &str {
        &self.operator_service_type
    }

    #[must_use]
    pub fn insecure_oauth_debug(&self) -> bool {
        self.insecure_oauth_debug
    }

    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        self.external_url.scheme() == "https"
    }
}

pub struct AuthState {
    config: AuthConfig,
    site: Arc<SiteConfigSource>,
    registry: Arc<ProviderRegistry>,
    users: Arc<dyn UserStore>,
    sessions: SessionStore,
    clients: Arc<IdpClients>,
    permissions: Arc<dyn PermissionSyncer>,
    events: Arc<dyn EventLogger>,
    licensing: Arc<dyn Licensing>,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        site: Arc<SiteConfigSource>,
        registry: Arc<ProviderRegistry>,
        users: Arc<dyn UserStore>,
        sessions: SessionStore,
        clients: Arc<IdpClients>,
    ) -> Self {
        Self {
            config,
            site,
            registry,
            users,
            sessions,
            clients,
            permissions: Arc::new(LogPermissionSyncer),
            events: Arc::new(LogEventLogger),
            licensing: Arc::new(AllowAllLicensing),
        }
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionSyncer>) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_licensing(mut self, licensing: Arc<dyn Licensing>) -> Self {
        self.licensing = licensing;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn site(&self) -> &Arc<SiteConfigSource> {
        &self.site
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<IdpClients> {
        &self.clients
    }

    #[must_use]
    pub fn permissions(&self) -> &Arc<dyn PermissionSyncer> {
        &self.permissions
    }

    #[must_use]
    pub fn licensing(&self) -> &Arc<dyn Licensing> {
        &self.licensing
    }

    /// Whether anonymous visitors may use the site (`auth.public`).
    #[must_use]
    pub fn public_access(&self) -> bool {
        self.site.current().auth_public
    }

    /// Lifetime of a new session: `auth.sessionExpiry`, else the configured TTL.
    #[must_use]
    pub fn session_expiry(&self) -> Duration {
        self.site
            .current()
            .session_expiry()
            .unwrap_or_else(|| Duration::seconds(self.config.session_ttl_seconds))
    }

    /// Emit a security event without waiting for the logger.
    pub fn record_event(&self, event: SecurityEvent) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let name = event.name.as_str();
            if let Err(err) = events.log_security_event(event).await {
                warn!(event = name, "Failed to record security event: {err:#}");
            }
        });
    }
}
