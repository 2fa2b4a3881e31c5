//! Authentication and session core.
//!
//! Every request passes [`middleware::session_middleware`], which turns the
//! session cookie into an [`Actor`], and then [`middleware::auth_middleware`],
//! which gives each configured provider family a chance to serve or annotate
//! the request before the require-auth policy runs.
//!
//! Providers come from the site configuration and live in the
//! [`ProviderRegistry`]; request handling waits until every configuration
//! source has reported once.

pub mod actor;
pub mod config;
pub mod cookies;
pub mod error;
pub mod external;
pub mod flow;
pub mod httpheader;
pub mod identity;
pub mod middleware;
pub mod providers;
pub mod redirect;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use actor::{Actor, AnonymousAccess};
pub use error::AuthError;
pub use providers::ProviderRegistry;
pub use session::SessionStore;
pub use state::{AuthConfig, AuthState};
