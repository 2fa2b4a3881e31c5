//! OAuth2 authorization-code login for code hosts (`/.auth/{github,gitlab,bitbucketcloud}`).

use anyhow::anyhow;
use chrono::{DateTime, TimeDelta, Utc};
use axum::{
    extract::{Query, Request},
    http::{HeaderMap, header::SET_COOKIE, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use super::{
    finish_login, found,
    login_state::{LoginOp, StateCookie},
    start_login,
    transport::TokenRequest,
    verify_state, with_headers,
};
use crate::auth::{
    actor::Actor,
    error::AuthError,
    identity::{ExternalAccountData, ExternalAccountSpec, GetAndSaveUserOp, NewUser, normalize_username},
    providers::{ConfigId, OAuthServiceType, Provider},
    state::AuthState,
};

/// Session data key holding the token metadata of the last OAuth sign-in.
pub const SESSION_DATA_KEY: &str = "oauth";

#[derive(Debug, Default, Deserialize)]
struct LoginParams {
    pc: Option<String>,
    redirect: Option<String>,
    op: Option<LoginOp>,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

fn state_cookie(state: &AuthState, service_type: OAuthServiceType) -> StateCookie {
    StateCookie::lax(service_type.as_str(), state.config().session_cookie_secure())
}

#[derive(Clone, Copy)]
enum Action {
    Login,
    Callback,
}

fn route(path: &str) -> Option<(OAuthServiceType, Action)> {
    let (family, action) = path.strip_prefix("/.auth/")?.split_once('/')?;
    let service_type = OAuthServiceType::from_type(family)?;
    match action {
        "login" => Some((service_type, Action::Login)),
        "callback" => Some((service_type, Action::Callback)),
        _ => None,
    }
}

/// Serve `/.auth/{service_type}/login` and `/callback`; pass anything else through.
pub async fn intercept(state: Arc<AuthState>, req: Request) -> Result<Response, Request> {
    let Some((service_type, action)) = route(req.uri().path()) else {
        return Err(req);
    };
    let (parts, _body) = req.into_parts();
    let response = match action {
        Action::Login => login(&state, service_type, &parts)
            .await
            .unwrap_or_else(IntoResponse::into_response),
        Action::Callback => callback(&state, service_type, &parts).await,
    };
    Ok(response)
}

async fn lookup_provider(
    state: &AuthState,
    service_type: OAuthServiceType,
    pc: Option<&str>,
) -> Result<Arc<Provider>, AuthError> {
    let provider = match pc.filter(|pc| !pc.is_empty()) {
        Some(pc) => {
            state
                .registry()
                .get_provider_by_config_id(&ConfigId::new(service_type.as_str(), pc))
                .await
        }
        None => {
            state
                .registry()
                .get_provider_by_service_type(service_type.as_str())
                .await
        }
    };
    provider
        .filter(|provider| provider.oauth().is_some())
        .ok_or(AuthError::BadRequest("Unknown authentication provider."))
}

fn base_url(provider: &Provider) -> Result<Url, AuthError> {
    Url::parse(&provider.cached_info().service_id).map_err(|err| AuthError::Config(anyhow!(err)))
}

fn callback_url(state: &AuthState, service_type: OAuthServiceType) -> Result<Url, AuthError> {
    state
        .config()
        .external_url()
        .join(&format!(".auth/{}/callback", service_type.as_str()))
        .map_err(|err| AuthError::Config(anyhow!(err)))
}

async fn login(
    state: &AuthState,
    service_type: OAuthServiceType,
    req: &Parts,
) -> Result<Response, AuthError> {
    let Query(params) = Query::<LoginParams>::try_from_uri(&req.uri)
        .map_err(|_| AuthError::BadRequest("Invalid login parameters."))?;
    let actor = req.extensions.get::<Actor>().copied().unwrap_or_default();
    let provider = lookup_provider(state, service_type, params.pc.as_deref()).await?;
    let Some((_, config)) = provider.oauth() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };

    let (encoded, set_cookie) = start_login(
        state,
        &req.headers,
        &actor,
        state_cookie(state, service_type),
        &provider,
        params.redirect.as_deref(),
        params.op,
    )?;

    let mut authorize = base_url(&provider)?
        .join(service_type.authorize_path())
        .map_err(|err| AuthError::Config(anyhow!(err)))?;
    authorize
        .query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", callback_url(state, service_type)?.as_str())
        .append_pair("response_type", "code")
        .append_pair("scope", service_type.scopes())
        .append_pair("state", &encoded);

    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, set_cookie);
    Ok(found(authorize.as_str(), headers))
}

async fn callback(state: &AuthState, service_type: OAuthServiceType, req: &Parts) -> Response {
    let cookie = state_cookie(state, service_type);
    let mut headers = HeaderMap::new();
    if let Ok(clear) = cookie.clear() {
        headers.append(SET_COOKIE, clear);
    }
    let response = match complete(state, service_type, cookie, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    with_headers(response, headers)
}

async fn complete(
    state: &AuthState,
    service_type: OAuthServiceType,
    cookie: StateCookie,
    req: &Parts,
) -> Result<Response, AuthError> {
    let Query(params) = Query::<CallbackParams>::try_from_uri(&req.uri)
        .map_err(|_| AuthError::BadRequest("Invalid callback parameters."))?;
    if let Some(error) = params.error {
        return Err(AuthError::IdentityProvider(anyhow!(
            "{} returned error {error:?}",
            service_type.as_str()
        )));
    }
    let login_state = verify_state(&req.headers, cookie, params.state.as_deref())?;
    if login_state.provider_id.kind != service_type.as_str() {
        return Err(AuthError::BadRequest("Invalid login state."));
    }
    let provider = state
        .registry()
        .get_provider_by_config_id(&login_state.provider_id)
        .await
        .ok_or(AuthError::BadRequest("Unknown authentication provider."))?;
    let Some((_, config)) = provider.oauth() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or(AuthError::BadRequest("Missing authorization code."))?;

    let base = base_url(&provider)?;
    let token_url = base
        .join(service_type.token_path())
        .map_err(|err| AuthError::Config(anyhow!(err)))?;
    let clients = state.clients();
    let token = clients
        .transport
        .exchange_code(&TokenRequest {
            token_url: token_url.to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            code,
            redirect_uri: callback_url(state, service_type)?.to_string(),
        })
        .await
        .map_err(AuthError::IdentityProvider)?;
    let (profile, raw) = clients
        .profiles
        .fetch_profile(
            clients.transport.as_ref(),
            service_type,
            &base,
            &token.access_token,
        )
        .await
        .map_err(AuthError::IdentityProvider)?;
    let username = normalize_username(&profile.username).map_err(AuthError::IdentityProvider)?;

    let info = provider.cached_info();
    let expiry = token_expiry(token.expires_in, Utc::now());
    let op = GetAndSaveUserOp {
        user_props: NewUser {
            username,
            email: profile.email,
            email_is_verified: profile.email_verified,
            display_name: profile.display_name,
            avatar_url: profile.avatar_url,
        },
        external_account: ExternalAccountSpec {
            service_type: service_type.as_str().to_string(),
            service_id: info.service_id.clone(),
            client_id: info.client_id.clone(),
            account_id: profile.account_id,
        },
        external_account_data: ExternalAccountData {
            auth_data: Some(json!({
                "token_type": token.token_type,
                "scope": token.scope,
                "expiry": expiry,
            })),
            account_data: Some(raw),
        },
        create_if_not_exist: config.allow_signup,
        lookup_by_username: false,
    };
    let actor = req.extensions.get::<Actor>().copied().unwrap_or_default();
    finish_login(
        state,
        &req.headers,
        &actor,
        op,
        &login_state.redirect,
        Some((
            SESSION_DATA_KEY,
            json!({ "provider": provider.config_id().to_string(), "expiry": expiry }),
        )),
    )
    .await
}

/// Absolute expiry of an access token; lifetimes the clock cannot represent
/// are dropped.
fn token_expiry(expires_in: Option<i64>, now: DateTime<Utc>) -> Option<String> {
    expires_in
        .and_then(TimeDelta::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .map(|expiry| expiry.to_rfc3339())
}
