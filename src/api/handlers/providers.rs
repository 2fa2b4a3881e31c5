use crate::auth::{AuthState, providers::CachedInfo};
use axum::{extract::Extension, response::Json};
use std::sync::Arc;

#[utoipa::path(
    get,
    path= "/.api/auth/providers",
    responses (
        (status = 200, description = "Sign-in options in display order", body = [CachedInfo]),
    ),
    tag= "session"
)]
// Public display data only; configuration secrets never leave the registry.
pub async fn list(state: Extension<Arc<AuthState>>) -> Json<Vec<CachedInfo>> {
    let providers = state
        .registry()
        .sorted_providers()
        .await
        .iter()
        .map(|provider| provider.cached_info().clone())
        .collect();
    Json(providers)
}
