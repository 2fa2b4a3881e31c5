use crate::{
    api,
    auth::{
        AuthConfig, AuthState, ProviderRegistry, SessionStore,
        config::{SiteConfig, SiteConfigSource},
        flow::IdpClients,
        identity::{MemoryUserStore, PgUserStore, UserStore},
        providers::watch::{WatchContext, expected_sources, spawn_watchers},
        session::{MemorySessionBackend, PgSessionBackend, SessionBackend},
    },
};
use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use url::Url;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 10);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub external_url: Url,
    pub site_config: Option<PathBuf>,
    pub site_config_poll_seconds: u64,
    pub session_secret: Option<SecretString>,
    pub session_ttl_seconds: i64,
    pub insecure_oauth_debug: bool,
}

fn random_secret() -> SecretString {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    SecretString::from(URL_SAFE_NO_PAD.encode(bytes))
}

async fn connect(dsn: &SecretString) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn.expose_secret())
        .await
        .context("Failed to connect to database")
}

fn spawn_session_purger(backend: Arc<PgSessionBackend>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match backend.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "expired sessions removed"),
                Err(err) => error!("Failed to purge expired sessions: {err:#}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database or site configuration cannot be loaded, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let site_config = match &args.site_config {
        Some(path) => SiteConfigSource::load_file(path)?,
        None => {
            warn!("No site configuration given; no authentication providers are enabled");
            SiteConfig::default()
        }
    };

    let pool = match &args.dsn {
        Some(dsn) => Some(connect(dsn).await?),
        None => {
            warn!("No database configured; users and sessions are kept in memory");
            None
        }
    };

    let (users, sessions_backend): (Arc<dyn UserStore>, Arc<dyn SessionBackend>) = match &pool {
        Some(pool) => {
            let backend = Arc::new(PgSessionBackend::new(pool.clone()));
            spawn_session_purger(Arc::clone(&backend));
            (Arc::new(PgUserStore::new(pool.clone())), backend)
        }
        None => (
            Arc::new(MemoryUserStore::new()),
            Arc::new(MemorySessionBackend::new()),
        ),
    };

    let session_secret = args.session_secret.unwrap_or_else(|| {
        warn!("PORTIERE_SESSION_SECRET is not set; sessions will not survive a restart");
        random_secret()
    });

    if args.insecure_oauth_debug {
        warn!("Identity provider traffic is being logged; disable PORTIERE_INSECURE_OAUTH_DEBUG in production");
    }

    let auth_config = AuthConfig::new(args.external_url)
        .with_session_ttl_seconds(args.session_ttl_seconds)
        .with_insecure_oauth_debug(args.insecure_oauth_debug);

    let sessions = SessionStore::new(
        sessions_backend,
        Arc::clone(&users),
        session_secret,
        chrono::Duration::seconds(auth_config.session_ttl_seconds()),
        auth_config.session_cookie_secure(),
    );

    let clients = Arc::new(IdpClients::http(auth_config.insecure_oauth_debug())?);
    let registry = Arc::new(ProviderRegistry::new(expected_sources()));
    let site = Arc::new(SiteConfigSource::new(site_config));

    let auth_state = Arc::new(AuthState::new(
        auth_config,
        Arc::clone(&site),
        Arc::clone(&registry),
        users,
        sessions,
        Arc::clone(&clients),
    ));

    let context = WatchContext {
        registry,
        clients,
        licensing: Arc::clone(auth_state.licensing()),
    };
    let _watchers = spawn_watchers(&context, &site);

    if let Some(path) = args.site_config {
        info!(path = %path.display(), "watching site configuration");
        let _poller =
            site.spawn_file_poller(path, Duration::from_secs(args.site_config_poll_seconds));
    }

    api::serve(args.port, api::app(auth_state, pool), shutdown_signal()).await
}
