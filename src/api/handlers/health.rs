use crate::{GIT_COMMIT_HASH, auth::AuthState};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
    providers: String,
}

async fn database_status(pool: Option<&PgPool>) -> &'static str {
    let Some(pool) = pool else {
        return "memory";
    };
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    match pool.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            match conn.ping().instrument(ping_span).await {
                Ok(()) => "ok",
                Err(error) => {
                    error!("Failed to ping database: {}", error);
                    "error"
                }
            }
        }
        Err(error) => {
            error!("Failed to acquire database connection: {}", error);
            "error"
        }
    }
}

#[utoipa::path(
    get,
    path= "/healthz",
    responses (
        (status = 200, description = "Database reachable and providers registered", body = [Health]),
        (status = 503, description = "Database unreachable or providers still loading", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(
    method: Method,
    state: Extension<Arc<AuthState>>,
    pool: Option<Extension<PgPool>>,
) -> impl IntoResponse {
    let database = database_status(pool.as_ref().map(|Extension(pool)| pool)).await;
    let providers = if state.registry().is_ready() {
        "ok"
    } else {
        "loading"
    };
    let is_healthy = database != "error" && providers == "ok";

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: database.to_string(),
        providers: providers.to_string(),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            debug!("X-App header: {:?}", x_app_header_value);

            let mut headers = HeaderMap::new();

            headers.insert("X-App", x_app_header_value);

            headers
        })
        .map_err(|err| {
            error!("Failed to parse X-App header: {}", err);
        });

    let headers = headers.unwrap_or_else(|()| HeaderMap::new());

    if is_healthy {
        (StatusCode::OK, headers, body)
    } else {
        debug!(database, providers, "service is unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}
