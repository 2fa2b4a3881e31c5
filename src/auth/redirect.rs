//! Open-redirect protection for post-login redirect targets.

use axum::http::{HeaderMap, header::REFERER};
use url::Url;

use super::error::AuthError;

/// Reduce `target` to a same-site relative URL.
///
/// Anything that is not a plain absolute path (absolute URLs, scheme-relative
/// `//host` forms, backslashes, control characters) collapses to `/`. For
/// accepted inputs the path is cleaned (`.`/`..` resolved, duplicate slashes
/// removed), the query is kept and the fragment dropped. Applying it twice
/// yields the same result as applying it once.
#[must_use]
pub fn safe_redirect_url(target: &str) -> String {
    if !target.starts_with('/')
        || target.starts_with("//")
        || target.contains('\\')
        || target.chars().any(char::is_control)
    {
        return "/".to_string();
    }

    let without_fragment = target.split_once('#').map_or(target, |(head, _)| head);
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let mut cleaned = clean_path(path);
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        cleaned.push('?');
        cleaned.push_str(query);
    }
    cleaned
}

/// Lexical path cleaning for rooted paths: the result always starts with a
/// single `/`, has no empty, `.` or `..` segments and no trailing slash
/// (except for the root itself).
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Resolve and validate the redirect target for a login request.
///
/// Uses the explicit `redirect` parameter when present, otherwise the
/// `returnTo` parameter of the Referer, otherwise `/`. Relative targets and
/// absolute targets on the same origin as `external_url` are accepted; any
/// other value fails the login instead of silently falling back.
///
/// # Errors
/// Returns [`AuthError::BadRequest`] when the chosen target is not acceptable.
pub fn resolve_login_redirect(
    redirect: Option<&str>,
    headers: &HeaderMap,
    external_url: &Url,
) -> Result<String, AuthError> {
    let candidate = match redirect.filter(|value| !value.is_empty()) {
        Some(value) => Some(value.to_string()),
        None => return_to_from_referer(headers),
    };
    match candidate {
        Some(value) => validate_redirect(&value, external_url),
        None => Ok("/".to_string()),
    }
}

fn return_to_from_referer(headers: &HeaderMap) -> Option<String> {
    let referer = headers.get(REFERER)?.to_str().ok()?;
    let referer = Url::parse(referer).ok()?;
    referer
        .query_pairs()
        .find(|(key, _)| key == "returnTo")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Accept `target` if it is relative or same-origin with `external_url`.
///
/// # Errors
/// Returns [`AuthError::BadRequest`] for cross-origin or malformed targets.
pub fn validate_redirect(target: &str, external_url: &Url) -> Result<String, AuthError> {
    const INVALID: AuthError = AuthError::BadRequest("Invalid redirect URL.");

    if target.starts_with('/') {
        if target.starts_with("//") || target.contains('\\') {
            return Err(INVALID);
        }
        return Ok(safe_redirect_url(target));
    }

    let parsed = Url::parse(target).map_err(|_| INVALID)?;
    if parsed.origin() != external_url.origin() {
        return Err(INVALID);
    }
    let mut relative = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        relative.push('?');
        relative.push_str(query);
    }
    Ok(safe_redirect_url(&relative))
}
