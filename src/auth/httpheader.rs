//! Authentication by a trusted proxy that asserts the username in a header.

use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

use super::{
    actor::Actor,
    error::AuthError,
    identity::{ExternalAccountData, ExternalAccountSpec, GetAndSaveUserOp, NewUser, get_and_save_user, normalize_username},
    middleware::is_allowlisted,
    providers::HTTP_HEADER_TYPE,
    state::AuthState,
};

/// Username and email asserted by the proxy, prefix already stripped.
#[derive(Debug, PartialEq, Eq)]
struct Asserted {
    username: String,
    email: Option<String>,
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Sign the request in as the user named by the configured header.
///
/// Requests that already carry a session, or lack the header, pass through
/// untouched. So do allow-listed routes while providers are still loading:
/// health checks must not wait for the registry.
pub async fn intercept(state: Arc<AuthState>, mut req: Request) -> Result<Response, Request> {
    let actor = req.extensions().get::<Actor>().copied().unwrap_or_default();
    if actor.is_authenticated() {
        return Err(req);
    }
    if !state.registry().is_ready() && is_allowlisted(req.uri().path()) {
        return Err(req);
    }
    let Some(provider) = state
        .registry()
        .get_provider_by_service_type(HTTP_HEADER_TYPE)
        .await
    else {
        return Err(req);
    };
    let Some(config) = provider.http_header() else {
        return Err(req);
    };

    let Some(raw) = header(&req, &config.username_header) else {
        return Err(req);
    };
    let username = match config.strip_username_header_prefix.as_deref() {
        Some(prefix) if !prefix.is_empty() => raw.strip_prefix(prefix).unwrap_or(&raw).to_string(),
        _ => raw,
    };
    let asserted = Asserted {
        email: config
            .email_header
            .as_deref()
            .and_then(|name| header(&req, name)),
        username,
    };
    if asserted.username.is_empty() {
        return Err(req);
    }

    let normalized = match normalize_username(&asserted.username) {
        Ok(normalized) => normalized,
        Err(err) => {
            warn!("Rejecting proxy-asserted username: {err:#}");
            return Ok(AuthError::BadRequest("Invalid username in authentication header.").into_response());
        }
    };
    let op = GetAndSaveUserOp {
        user_props: NewUser {
            username: normalized,
            email_is_verified: asserted.email.is_some(),
            email: asserted.email,
            display_name: String::new(),
            avatar_url: String::new(),
        },
        external_account: ExternalAccountSpec {
            service_type: HTTP_HEADER_TYPE.to_string(),
            service_id: String::new(),
            client_id: String::new(),
            account_id: asserted.username,
        },
        external_account_data: ExternalAccountData::default(),
        create_if_not_exist: true,
        lookup_by_username: true,
    };
    match get_and_save_user(&state, &actor, op).await {
        Ok(resolved) => {
            req.extensions_mut().insert(Actor::from_user(resolved.user_id));
            Err(req)
        }
        Err(err) => Ok(AuthError::Account(err).into_response()),
    }
}
