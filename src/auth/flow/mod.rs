//! Browser sign-in flows: OAuth2 code-host login, OpenID Connect and SAML.
//!
//! Every family follows the same shape. `login` binds a random CSRF token
//! into a short-lived state cookie and into the encoded [`LoginState`] sent
//! to the identity provider. The callback checks both match, looks the
//! provider up by the id embedded in the state, resolves the user, issues a
//! session and redirects to the validated target. The state cookie is
//! cleared on every callback outcome.

pub mod login_state;
pub mod oauth;
pub mod oidc;
pub mod profile;
pub mod saml;
pub mod transport;
pub mod xmldsig;

use anyhow::anyhow;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use self::{
    login_state::{LoginOp, LoginState, StateCookie},
    profile::{HttpProfileFetcher, ProfileFetcher},
    saml::{DefaultSamlBackend, SamlBackend},
    transport::{HttpTransport, OAuthTransport},
};
use super::{
    actor::Actor,
    error::AuthError,
    external::{SecurityEvent, SecurityEventName},
    identity::{GetAndSaveUserOp, get_and_save_user},
    providers::Provider,
    redirect::{resolve_login_redirect, safe_redirect_url},
    state::AuthState,
};

pub use login_state::LoginStateError;

/// Outbound collaborators of the sign-in flows.
pub struct IdpClients {
    pub transport: Arc<dyn OAuthTransport>,
    pub profiles: Arc<dyn ProfileFetcher>,
    pub saml: Arc<dyn SamlBackend>,
}

impl IdpClients {
    #[must_use]
    pub fn new(
        transport: Arc<dyn OAuthTransport>,
        profiles: Arc<dyn ProfileFetcher>,
        saml: Arc<dyn SamlBackend>,
    ) -> Self {
        Self {
            transport,
            profiles,
            saml,
        }
    }

    /// Real HTTP clients. `debug` enables verbose transport logging.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn http(debug: bool) -> anyhow::Result<Self> {
        let transport: Arc<dyn OAuthTransport> = Arc::new(HttpTransport::new(debug)?);
        Ok(Self {
            saml: Arc::new(DefaultSamlBackend::new(Arc::clone(&transport))),
            profiles: Arc::new(HttpProfileFetcher),
            transport,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let transport: Arc<dyn OAuthTransport> =
            Arc::new(crate::auth::test_support::StubTransport::default());
        Self {
            saml: Arc::new(DefaultSamlBackend::new(Arc::clone(&transport))),
            profiles: Arc::new(HttpProfileFetcher),
            transport,
        }
    }
}

/// 302 to `location` with the given extra headers.
pub(crate) fn found(location: &str, mut headers: HeaderMap) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(LOCATION, value);
            (StatusCode::FOUND, headers).into_response()
        }
        Err(_) => with_headers(
            AuthError::BadRequest("Invalid redirect URL.").into_response(),
            headers,
        ),
    }
}

pub(crate) fn with_headers(mut response: Response, headers: HeaderMap) -> Response {
    for (name, value) in &headers {
        response.headers_mut().append(name, value.clone());
    }
    response
}

/// Begin a login: validate the redirect target and mint the login state.
///
/// Returns the encoded state and the `Set-Cookie` header binding it.
pub(crate) fn start_login(
    state: &AuthState,
    headers: &HeaderMap,
    actor: &Actor,
    cookie: StateCookie,
    provider: &Provider,
    redirect: Option<&str>,
    op: Option<LoginOp>,
) -> Result<(String, HeaderValue), AuthError> {
    let op = op.unwrap_or_default();
    if op == LoginOp::LinkAccount && !actor.is_authenticated() {
        return Err(AuthError::BadRequest("Sign in before linking an account."));
    }
    let redirect = resolve_login_redirect(redirect, headers, state.config().external_url())?;
    let login_state = LoginState::new(redirect, provider.config_id().clone(), op)
        .map_err(AuthError::Infrastructure)?;
    let encoded = login_state
        .encode()
        .map_err(|err| AuthError::Infrastructure(anyhow!(err)))?;
    let set_cookie = cookie
        .set(&encoded)
        .map_err(|err| AuthError::Infrastructure(anyhow!(err)))?;
    Ok((encoded, set_cookie))
}

/// Check the callback `state` against the state cookie and decode it.
pub(crate) fn verify_state(
    headers: &HeaderMap,
    cookie: StateCookie,
    state_param: Option<&str>,
) -> Result<LoginState, AuthError> {
    let Some(expected) = cookie.read(headers) else {
        return Err(AuthError::Csrf);
    };
    let Some(received) = state_param.filter(|value| !value.is_empty()) else {
        return Err(AuthError::Csrf);
    };
    if expected != received {
        return Err(AuthError::Csrf);
    }
    LoginState::decode(received).map_err(|_| AuthError::BadRequest("Invalid login state."))
}

/// Resolve the user, issue the session and redirect.
pub(crate) async fn finish_login(
    state: &AuthState,
    request: &HeaderMap,
    actor: &Actor,
    op: GetAndSaveUserOp,
    redirect: &str,
    session_data: Option<(&str, Value)>,
) -> Result<Response, AuthError> {
    let service_type = op.external_account.service_type.clone();
    let resolved = get_and_save_user(state, actor, op).await?;

    let session_actor = Actor {
        operator: service_type == state.config().operator_service_type(),
        ..Actor::from_user(resolved.user_id)
    };
    let mut response = HeaderMap::new();
    let cookie = state
        .sessions()
        .set_actor(
            request,
            &mut response,
            Some(&session_actor),
            Some(state.session_expiry()),
            None,
        )
        .await?;
    if let (Some(cookie), Some((key, value))) = (cookie, session_data) {
        if let Err(err) = state.sessions().set_data(&cookie, key, &value).await {
            warn!(user_id = resolved.user_id, "Failed to store session data: {err}");
        }
    }

    state.record_event(SecurityEvent {
        name: SecurityEventName::SignInSucceeded,
        user_id: Some(resolved.user_id),
        service_type,
        detail: String::new(),
    });
    Ok(found(&safe_redirect_url(redirect), response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{cookies::SameSite, providers::ConfigId};
    use axum::http::header::{COOKIE, SET_COOKIE};

    #[test]
    fn verify_state_requires_matching_cookie() -> anyhow::Result<()> {
        let cookie = StateCookie::lax("github", false);
        let state = LoginState::new("/".to_string(), ConfigId::new("github", "x"), LoginOp::Login)?;
        let encoded = state.encode()?;

        let mut headers = HeaderMap::new();
        assert!(matches!(
            verify_state(&headers, cookie, Some(&encoded)),
            Err(AuthError::Csrf)
        ));

        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("github-state-cookie={encoded}"))?,
        );
        assert!(matches!(
            verify_state(&headers, cookie, Some("other")),
            Err(AuthError::Csrf)
        ));
        assert!(matches!(verify_state(&headers, cookie, None), Err(AuthError::Csrf)));
        assert_eq!(verify_state(&headers, cookie, Some(&encoded)).ok(), Some(state));
        Ok(())
    }

    #[test]
    fn found_sets_location() {
        let response = found("/search", HeaderMap::new());
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).and_then(|v| v.to_str().ok()),
            Some("/search")
        );
        assert_eq!(SameSite::cross_site(false), SameSite::Lax);
    }

    #[test]
    fn with_headers_appends_cookies() -> anyhow::Result<()> {
        let mut extra = HeaderMap::new();
        extra.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        extra.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let response = with_headers(StatusCode::OK.into_response(), extra);
        assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
        Ok(())
    }
}
