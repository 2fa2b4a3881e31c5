//! Cookie names and `Set-Cookie` helpers.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};

/// Session cookie carrying the opaque session token.
pub const SESSION_COOKIE: &str = "sgs";

/// Marker set on sign-out that suppresses the single-provider SSO redirect.
pub const SIGN_OUT_COOKIE: &str = "sg-signout";

pub const SIGN_OUT_MAX_AGE_SECONDS: i64 = 5 * 365 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    None,
}

impl SameSite {
    /// `None` is only honored by browsers together with `Secure`.
    #[must_use]
    pub const fn cross_site(secure: bool) -> Self {
        if secure { Self::None } else { Self::Lax }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

/// Value of the first cookie named `name`.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().unwrap_or_default().trim();
            let Some(val) = parts.next() else {
                continue;
            };
            if key == name {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// `Set-Cookie` value for an `HttpOnly` cookie scoped to `/`.
///
/// # Errors
/// Returns an error if `value` contains bytes not allowed in a header.
pub fn build_cookie(
    name: &str,
    value: &str,
    max_age_seconds: i64,
    secure: bool,
    same_site: SameSite,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{name}={value}; Path=/; HttpOnly; SameSite={}; Max-Age={max_age_seconds}",
        same_site.as_str()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// `Set-Cookie` value that removes `name`.
///
/// # Errors
/// Returns an error if `name` contains bytes not allowed in a header.
pub fn clear_cookie(
    name: &str,
    secure: bool,
    same_site: SameSite,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(name, "", 0, secure, same_site)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; sgs=abc123; sg-signout=true"),
        );
        assert_eq!(cookie_value(&headers, SESSION_COOKIE).as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, SIGN_OUT_COOKIE).as_deref(), Some("true"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn builds_secure_cross_site_cookie() -> Result<(), InvalidHeaderValue> {
        let cookie = build_cookie("sgs", "t", 60, true, SameSite::cross_site(true))?;
        assert_eq!(
            cookie.to_str().unwrap_or_default(),
            "sgs=t; Path=/; HttpOnly; SameSite=None; Max-Age=60; Secure"
        );
        let cleared = clear_cookie("sgs", false, SameSite::cross_site(false))?;
        assert_eq!(
            cleared.to_str().unwrap_or_default(),
            "sgs=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"
        );
        Ok(())
    }
}
