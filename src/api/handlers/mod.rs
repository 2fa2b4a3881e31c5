pub mod health;
pub mod providers;
pub mod session;
pub mod version;

use axum::http::{StatusCode, Uri};
use tracing::debug;

pub async fn not_found(uri: Uri) -> (StatusCode, &'static str) {
    debug!(path = uri.path(), "no route");
    (StatusCode::NOT_FOUND, "Not found.")
}
