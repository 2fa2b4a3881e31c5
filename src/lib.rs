//! # Portiere (authentication and session gateway)
//!
//! `portiere` decides, for every inbound request, who the caller is and
//! whether they may proceed. Identity comes from a session cookie or from
//! one of several interchangeable providers: builtin passwords, OAuth2 code
//! hosts (GitHub, GitLab, Bitbucket Cloud), OpenID Connect, SAML and a
//! trusted proxy header.
//!
//! ## Providers
//!
//! Providers are declared in the site configuration (`auth.providers`) and
//! can be added, removed or reconfigured while the process runs. Requests
//! that need the provider set wait until every provider family has loaded
//! the initial configuration.
//!
//! ## Sessions
//!
//! Sessions are server-side records addressed by an opaque cookie (`sgs`).
//! A session is only honored while it is unexpired, its user still exists
//! with the same creation time, and it was active after the user's last
//! forced sign-out.
//!
//! ## Anonymous access
//!
//! Only allow-listed routes (sign-in, health, the `/.auth/` flows, ...) are
//! reachable without a session unless the site is public (`auth.public`).
//! Unauthenticated API calls get `401`; browser requests are redirected to
//! sign-in.

pub mod api;
pub mod auth;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
