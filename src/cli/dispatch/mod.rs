//! Map validated CLI arguments to the action to run.

use crate::cli::{
    actions::{Action, server::Args},
    commands::{
        ARG_DSN, ARG_EXTERNAL_URL, ARG_INSECURE_OAUTH_DEBUG, ARG_PORT, ARG_SESSION_SECRET,
        ARG_SESSION_TTL_SECONDS, ARG_SITE_CONFIG, ARG_SITE_CONFIG_POLL_SECONDS,
    },
};
use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;
use std::path::PathBuf;
use url::Url;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if the external URL is not an absolute http(s) URL.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let external_url = matches
        .get_one::<String>(ARG_EXTERNAL_URL)
        .context("missing required argument: --external-url")?;
    let external_url = Url::parse(external_url).context("invalid PORTIERE_EXTERNAL_URL")?;
    if !matches!(external_url.scheme(), "http" | "https") || external_url.host_str().is_none() {
        return Err(anyhow!(
            "PORTIERE_EXTERNAL_URL must be an absolute http(s) URL, got: {external_url}"
        ));
    }

    Ok(Action::Server(Args {
        port: matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080),
        dsn: matches
            .get_one::<String>(ARG_DSN)
            .map(|dsn| SecretString::from(dsn.clone())),
        external_url,
        site_config: matches.get_one::<PathBuf>(ARG_SITE_CONFIG).cloned(),
        site_config_poll_seconds: matches
            .get_one::<u64>(ARG_SITE_CONFIG_POLL_SECONDS)
            .copied()
            .unwrap_or(5),
        session_secret: matches
            .get_one::<String>(ARG_SESSION_SECRET)
            .map(|secret| SecretString::from(secret.clone())),
        session_ttl_seconds: matches
            .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
            .copied()
            .unwrap_or(2_592_000),
        insecure_oauth_debug: matches.get_flag(ARG_INSECURE_OAUTH_DEBUG),
    }))
}
