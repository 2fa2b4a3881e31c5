//! Builtin password sign-in, sign-out and the current-session endpoint.

use crate::auth::{
    Actor, AuthError, AuthState,
    external::{SecurityEvent, SecurityEventName},
    identity::User,
    providers::BUILTIN_TYPE,
};
use anyhow::anyhow;
use axum::{
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;

#[derive(ToSchema, Deserialize)]
pub struct SignInRequest {
    /// Username or email address.
    email: String,
    password: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct SessionUser {
    id: i32,
    username: String,
    display_name: String,
    avatar_url: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct SessionInfo {
    actor: Actor,
    user: Option<SessionUser>,
}

impl SessionInfo {
    fn new(actor: Actor, user: Option<User>) -> Self {
        Self {
            actor,
            user: user.map(|user| SessionUser {
                id: user.id,
                username: user.username,
                display_name: user.display_name,
                avatar_url: user.avatar_url,
            }),
        }
    }
}

fn event(name: SecurityEventName, user_id: Option<i32>) -> SecurityEvent {
    SecurityEvent {
        name,
        user_id,
        service_type: BUILTIN_TYPE.to_string(),
        detail: String::new(),
    }
}

#[utoipa::path(
    post,
    path= "/-/sign-in",
    request_body = SignInRequest,
    responses (
        (status = 200, description = "Signed in; the session cookie is set", body = SessionInfo),
        (status = 400, description = "Builtin sign-in disabled or missing credentials", body = String),
        (status = 401, description = "Wrong username, email or password", body = String),
    ),
    tag= "session"
)]
#[instrument(skip_all)]
pub async fn sign_in(
    state: Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Json(request): Json<SignInRequest>,
) -> Result<Response, AuthError> {
    if state
        .registry()
        .get_provider_by_service_type(BUILTIN_TYPE)
        .await
        .is_none()
    {
        return Err(AuthError::BadRequest("Password sign-in is not enabled."));
    }

    let login = request.email.trim();
    if login.is_empty() || request.password.is_empty() {
        return Err(AuthError::BadRequest("Email and password are required."));
    }

    let user = state
        .users()
        .check_password(login, &request.password)
        .await
        .map_err(AuthError::Infrastructure)?;
    let Some(user) = user else {
        state.record_event(event(SecurityEventName::SignInFailed, None));
        return Err(AuthError::InvalidCredentials);
    };

    let actor = Actor::from_user(user.id);
    let mut response_headers = HeaderMap::new();
    state
        .sessions()
        .set_actor(
            &headers,
            &mut response_headers,
            Some(&actor),
            Some(state.session_expiry()),
            Some(user.created_at),
        )
        .await?;

    info!(user_id = user.id, "password sign-in");
    state.record_event(event(SecurityEventName::SignInSucceeded, Some(user.id)));

    Ok((response_headers, Json(SessionInfo::new(actor, Some(user)))).into_response())
}

/// Delete the current session and set the sign-out marker.
async fn end_session(
    state: &AuthState,
    headers: &HeaderMap,
    actor: Actor,
) -> Result<HeaderMap, AuthError> {
    let mut response_headers = HeaderMap::new();
    state
        .sessions()
        .set_actor(headers, &mut response_headers, None, None, None)
        .await?;
    let marker = state
        .sessions()
        .sign_out_cookie()
        .map_err(|err| AuthError::Infrastructure(anyhow!(err)))?;
    response_headers.append(SET_COOKIE, marker);

    if actor.is_authenticated() {
        info!(user_id = actor.uid, "signed out");
        state.record_event(event(SecurityEventName::SignOutSucceeded, Some(actor.uid)));
    }
    Ok(response_headers)
}

#[utoipa::path(
    get,
    path= "/-/sign-out",
    responses (
        (status = 302, description = "Session cleared; redirects to the home page"),
    ),
    tag= "session"
)]
pub async fn sign_out(
    state: Extension<Arc<AuthState>>,
    actor: Actor,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    let mut response_headers = end_session(&state, &headers, actor).await?;
    response_headers.insert(LOCATION, HeaderValue::from_static("/"));
    Ok((StatusCode::FOUND, response_headers).into_response())
}

#[utoipa::path(
    post,
    path= "/-/sign-out",
    responses (
        (status = 204, description = "Session cleared"),
    ),
    tag= "session"
)]
pub async fn sign_out_post(
    state: Extension<Arc<AuthState>>,
    actor: Actor,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    let response_headers = end_session(&state, &headers, actor).await?;
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

#[utoipa::path(
    get,
    path= "/.api/session",
    responses (
        (status = 200, description = "The caller and, when signed in, their profile", body = SessionInfo),
        (status = 401, description = "Private mode requires authentication", body = String),
    ),
    tag= "session"
)]
pub async fn current(
    state: Extension<Arc<AuthState>>,
    actor: Actor,
) -> Result<Json<SessionInfo>, AuthError> {
    let user = if actor.is_authenticated() {
        state
            .users()
            .get_by_id(actor.uid)
            .await
            .map_err(AuthError::Infrastructure)?
    } else {
        None
    };
    Ok(Json(SessionInfo::new(actor, user)))
}
