//! Authentication providers and the registry that holds the active set.

mod provider;
mod registry;
pub mod watch;

pub use provider::{
    BUILTIN_TYPE, CachedInfo, ConfigId, HTTP_HEADER_TYPE, MetadataCache, OAuthServiceType,
    OIDC_TYPE, Provider, ProviderKind, SAML_TYPE,
};
pub use registry::ProviderRegistry;
