use crate::GIT_COMMIT_HASH;

#[utoipa::path(
    get,
    path= "/__version",
    responses (
        (status = 200, description = "Running version and build commit", body = String, content_type = "text/plain")
    ),
    tag= "health"
)]
pub async fn version() -> String {
    let short_hash = GIT_COMMIT_HASH.get(..7).unwrap_or(GIT_COMMIT_HASH);
    format!("{}_{short_hash}", env!("CARGO_PKG_VERSION"))
}
