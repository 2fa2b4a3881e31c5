//! OpenID Connect login (`/.auth/openidconnect`).

use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{Query, Request},
    http::{HeaderMap, header::SET_COOKIE, request::Parts},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, jwk::JwkSet};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::{
    IdpClients, finish_login, found,
    login_state::{LoginOp, StateCookie},
    start_login,
    transport::TokenRequest,
    verify_state, with_headers,
};
use crate::auth::{
    actor::Actor,
    error::AuthError,
    identity::{ExternalAccountData, ExternalAccountSpec, GetAndSaveUserOp, NewUser, normalize_username},
    providers::{ConfigId, OIDC_TYPE, Provider},
    state::AuthState,
};

const PREFIX: &str = "/.auth/openidconnect/";

/// Session data key holding the ID token metadata of the last OIDC sign-in.
pub const SESSION_DATA_KEY: &str = "oidc";

/// Subset of the discovery document the login flow needs.
#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

pub struct OidcMetadata {
    pub discovery: DiscoveryDocument,
    pub jwks: JwkSet,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Fetch the discovery document and signing keys of `issuer`.
///
/// # Errors
/// Returns an error if either document cannot be fetched or parsed, or the
/// discovery document names a different issuer.
pub async fn fetch_metadata(clients: &IdpClients, issuer: &str) -> Result<OidcMetadata> {
    let issuer = issuer.trim_end_matches('/');
    let url = format!("{issuer}/.well-known/openid-configuration");
    let discovery: DiscoveryDocument = serde_json::from_value(
        clients
            .transport
            .get_json(&url, None)
            .await
            .context("failed to fetch discovery document")?,
    )
    .context("invalid discovery document")?;
    if discovery.issuer.trim_end_matches('/') != issuer {
        return Err(anyhow!(
            "discovery document issuer {} does not match {issuer}",
            discovery.issuer
        ));
    }
    let jwks: JwkSet = serde_json::from_value(
        clients
            .transport
            .get_json(&discovery.jwks_uri, None)
            .await
            .context("failed to fetch JWKS")?,
    )
    .context("invalid JWKS")?;
    Ok(OidcMetadata { discovery, jwks })
}

/// Verify signature, issuer, audience and expiry of an ID token.
///
/// # Errors
/// Returns an error describing the first failed check.
pub fn verify_id_token(
    metadata: &OidcMetadata,
    id_token: &str,
    client_id: &str,
) -> Result<IdTokenClaims> {
    let header = jsonwebtoken::decode_header(id_token).context("malformed ID token")?;
    if matches!(
        header.alg,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    ) {
        return Err(anyhow!("ID token uses unsupported algorithm {:?}", header.alg));
    }
    let kid = header
        .kid
        .ok_or_else(|| anyhow!("ID token header has no kid"))?;
    let jwk = metadata
        .jwks
        .find(&kid)
        .ok_or_else(|| anyhow!("no signing key with kid {kid}"))?;
    let key = DecodingKey::from_jwk(jwk).context("unusable signing key")?;

    let mut validation = Validation::new(header.alg);
    validation.set_audience(&[client_id]);
    validation.set_issuer(&[metadata.discovery.issuer.as_str()]);
    let data = jsonwebtoken::decode::<IdTokenClaims>(id_token, &key, &validation)
        .context("ID token validation failed")?;
    Ok(data.claims)
}

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

fn state_cookie(state: &AuthState) -> StateCookie {
    StateCookie::lax(OIDC_TYPE, state.config().session_cookie_secure())
}

fn callback_url(state: &AuthState) -> Result<Url, AuthError> {
    state
        .config()
        .external_url()
        .join(".auth/openidconnect/callback")
        .map_err(|err| AuthError::Config(anyhow!(err)))
}

/// Cached metadata, refreshed inline when missing.
async fn metadata(state: &AuthState, provider: &Provider) -> Result<Arc<OidcMetadata>, AuthError> {
    let Some((_, cache)) = provider.oidc() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    match cache.get() {
        Some(metadata) => Ok(metadata),
        None => refetch_metadata(state, provider).await,
    }
}

async fn refetch_metadata(
    state: &AuthState,
    provider: &Provider,
) -> Result<Arc<OidcMetadata>, AuthError> {
    provider
        .refresh(state.clients())
        .await
        .map_err(AuthError::Config)?;
    provider
        .oidc()
        .and_then(|(_, cache)| cache.get())
        .ok_or_else(|| AuthError::Config(anyhow!("OpenID Connect metadata unavailable")))
}

/// Whether `id_token` names a signing key that `metadata` does not hold.
fn signed_with_unknown_key(metadata: &OidcMetadata, id_token: &str) -> bool {
    jsonwebtoken::decode_header(id_token)
        .ok()
        .and_then(|header| header.kid)
        .is_some_and(|kid| metadata.jwks.find(&kid).is_none())
}

/// Serve `/.auth/openidconnect/login` and `/callback`.
pub async fn intercept(state: Arc<AuthState>, req: Request) -> Result<Response, Request> {
    let action = match req.uri().path().strip_prefix(PREFIX) {
        Some("login") => true,
        Some("callback") => false,
        _ => return Err(req),
    };
    let (parts, _body) = req.into_parts();
    let response = if action {
        login(&state, &parts)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    } else {
        callback(&state, &parts).await
    };
    Ok(response)
}

async fn login(state: &AuthState, req: &Parts) -> Result<Response, AuthError> {
    let Query(params) = Query::<LoginParams>::try_from_uri(&req.uri)
        .map_err(|_| AuthError::BadRequest("Invalid login parameters."))?;
    let actor = req.extensions.get::<Actor>().copied().unwrap_or_default();
    let provider = match params.pc.as_deref().filter(|pc| !pc.is_empty()) {
        Some(pc) => {
            state
                .registry()
                .get_provider_by_config_id(&ConfigId::new(OIDC_TYPE, pc))
                .await
        }
        None => state.registry().get_provider_by_service_type(OIDC_TYPE).await,
    }
    .ok_or(AuthError::BadRequest("Unknown authentication provider."))?;
    let Some((config, _)) = provider.oidc() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    let metadata = metadata(state, &provider).await?;

    let (encoded, set_cookie) = start_login(
        state,
        &req.headers,
        &actor,
        state_cookie(state),
        &provider,
        params.redirect.as_deref(),
        params.op,
    )?;

    let mut authorize = Url::parse(&metadata.discovery.authorization_endpoint)
        .map_err(|err| AuthError::Config(anyhow!(err)))?;
    authorize
        .query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", callback_url(state)?.as_str())
        .append_pair("response_type", "code")
        .append_pair("scope", "openid profile email")
        .append_pair("state", &encoded)
        .append_pair("nonce", &encoded);

    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, set_cookie);
    Ok(found(authorize.as_str(), headers))
}

async fn callback(state: &AuthState, req: &Parts) -> Response {
    let cookie = state_cookie(state);
    let mut headers = HeaderMap::new();
    if let Ok(clear) = cookie.clear() {
        headers.append(SET_COOKIE, clear);
    }
    let response = match complete(state, cookie, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    with_headers(response, headers)
}

async fn complete(
    state: &AuthState,
    cookie: StateCookie,
    req: &Parts,
) -> Result<Response, AuthError> {
    let Query(params) = Query::<CallbackParams>::try_from_uri(&req.uri)
        .map_err(|_| AuthError::BadRequest("Invalid callback parameters."))?;
    if let Some(error) = params.error {
        return Err(AuthError::IdentityProvider(anyhow!(
            "OpenID Connect provider returned error {error:?}"
        )));
    }
    let state_param = params.state.unwrap_or_default();
    let login_state = verify_state(&req.headers, cookie, Some(&state_param))?;
    if login_state.provider_id.kind != OIDC_TYPE {
        return Err(AuthError::BadRequest("Invalid login state."));
    }
    let provider = state
        .registry()
        .get_provider_by_config_id(&login_state.provider_id)
        .await
        .ok_or(AuthError::BadRequest("Unknown authentication provider."))?;
    let Some((config, _)) = provider.oidc() else {
        return Err(AuthError::BadRequest("Unknown authentication provider."));
    };
    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or(AuthError::BadRequest("Missing authorization code."))?;
    let mut metadata = metadata(state, &provider).await?;

    let clients = state.clients();
    let token = clients
        .transport
        .exchange_code(&TokenRequest {
            token_url: metadata.discovery.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            code,
            redirect_uri: callback_url(state)?.to_string(),
        })
        .await
        .map_err(AuthError::IdentityProvider)?;
    let id_token = token
        .id_token
        .as_deref()
        .ok_or_else(|| AuthError::IdentityProvider(anyhow!("token response has no id_token")))?;
    if signed_with_unknown_key(&metadata, id_token) {
        // Keys rotate; fetch them once more before giving up on the token.
        debug!(provider = %provider.config_id(), "ID token signed with an unknown key, refetching JWKS");
        metadata = refetch_metadata(state, &provider).await?;
    }
    let mut claims = verify_id_token(&metadata, id_token, &config.client_id)
        .map_err(AuthError::IdentityProvider)?;
    if claims.nonce.as_deref() != Some(state_param.as_str()) {
        return Err(AuthError::IdentityProvider(anyhow!("ID token nonce mismatch")));
    }

    let mut userinfo = Value::Null;
    if let Some(endpoint) = &metadata.discovery.userinfo_endpoint {
        match clients
            .transport
            .get_json(endpoint, Some(&token.access_token))
            .await
        {
            Ok(info) if info.get("sub").and_then(Value::as_str) == Some(claims.sub.as_str()) => {
                merge_userinfo(&mut claims, &info);
                userinfo = info;
            }
            Ok(_) => warn!("Ignoring userinfo response for a different subject"),
            Err(err) => warn!("Failed to fetch OpenID Connect userinfo: {err:#}"),
        }
    }

    let asserted = claims
        .preferred_username
        .clone()
        .or_else(|| claims.email.clone())
        .unwrap_or_else(|| claims.sub.clone());
    let username = normalize_username(&asserted).map_err(AuthError::IdentityProvider)?;
    let service_type = config
        .service_type
        .clone()
        .unwrap_or_else(|| OIDC_TYPE.to_string());
    let op = GetAndSaveUserOp {
        user_props: NewUser {
            username,
            email: claims.email.clone(),
            email_is_verified: claims.email_verified.unwrap_or(false),
            display_name: claims.name.clone().unwrap_or_default(),
            avatar_url: claims.picture.clone().unwrap_or_default(),
        },
        external_account: ExternalAccountSpec {
            service_type,
            service_id: provider.cached_info().service_id.clone(),
            client_id: config.client_id.clone(),
            account_id: claims.sub.clone(),
        },
        external_account_data: ExternalAccountData {
            auth_data: Some(json!({ "token_type": token.token_type, "expiry": claims.exp })),
            account_data: Some(json!({ "userinfo": userinfo })),
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
            json!({ "provider": provider.config_id().to_string(), "expiry": claims.exp }),
        )),
    )
    .await
}

fn merge_userinfo(claims: &mut IdTokenClaims, info: &Value) {
    let text = |field: &str| info.get(field).and_then(Value::as_str).map(ToString::to_string);
    if claims.email.is_none() {
        claims.email = text("email");
        claims.email_verified = info.get("email_verified").and_then(Value::as_bool);
    }
    if claims.preferred_username.is_none() {
        claims.preferred_username = text("preferred_username");
    }
    if claims.name.is_none() {
        claims.name = text("name");
    }
    if claims.picture.is_none() {
        claims.picture = text("picture");
    }
}
