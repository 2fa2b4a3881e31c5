//! Error taxonomy for the authentication surface.
//!
//! Every variant carries a fixed, user-safe message that is the only thing
//! sent to the client. The diagnostic (`Display` plus the `source` chain) is
//! logged server side when the error is turned into a response.

use axum::{
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use super::identity::ResolveError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Misconfigured provider (missing issuer, bad URL, ...).
    #[error("authentication provider misconfigured")]
    Config(#[source] anyhow::Error),

    /// Untrusted input failed validation. The message is a static string and
    /// never contains the rejected value.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("login state cookie does not match the state parameter")]
    Csrf,

    /// Token exchange, ID token verification or profile fetch failed.
    #[error("identity provider error")]
    IdentityProvider(#[source] anyhow::Error),

    #[error(transparent)]
    Account(#[from] ResolveError),

    #[error("invalid credentials")]
    InvalidCredentials,

    /// Session backend or user store unreachable. Fails closed.
    #[error("infrastructure failure")]
    Infrastructure(#[source] anyhow::Error),
}

impl AuthError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Csrf | Self::IdentityProvider(_) | Self::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            Self::Account(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Message returned to the client.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            Self::Config(_) => {
                "The authentication provider is misconfigured. Ask a site admin for help."
                    .to_string()
            }
            Self::BadRequest(message) => (*message).to_string(),
            Self::Csrf => "Authentication failed. Try signing in again (and clearing cookies for the current site).".to_string(),
            Self::IdentityProvider(_) => {
                "Authentication failed. Try signing in again.".to_string()
            }
            Self::Account(err) => err.safe_message().to_string(),
            Self::InvalidCredentials => "Authentication failed.".to_string(),
            Self::Infrastructure(_) => "Internal server error.".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = ?self, "authentication request failed");
        } else {
            warn!(error = ?self, "authentication request rejected");
        }
        (
            status,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.safe_message(),
        )
            .into_response()
    }
}
