//! Round-trip state carried through the identity provider redirect.

use anyhow::Context;
use axum::http::{HeaderMap, HeaderValue, header::InvalidHeaderValue};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};

use crate::auth::{
    cookies::{SameSite, build_cookie, clear_cookie, cookie_value},
    providers::ConfigId,
};

/// Lifetime of the state cookie; a login has this long to come back.
pub const STATE_COOKIE_MAX_AGE_SECONDS: i64 = 15 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginOp {
    #[default]
    Login,
    LinkAccount,
}

/// Encoded, not encrypted: nothing in here is secret. The CSRF token only
/// proves the callback belongs to a login started by this browser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    #[serde(rename = "csrf")]
    pub csrf_token: String,
    pub redirect: String,
    #[serde(rename = "pid")]
    pub provider_id: ConfigId,
    #[serde(default)]
    pub op: LoginOp,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginStateError {
    #[error("login state is not valid base64")]
    Encoding(#[from] base64::DecodeError),

    #[error("login state is not valid JSON")]
    Json(#[from] serde_json::Error),
}

impl LoginState {
    /// New state with a fresh random CSRF token.
    ///
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn new(redirect: String, provider_id: ConfigId, op: LoginOp) -> anyhow::Result<Self> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate CSRF token")?;
        Ok(Self {
            csrf_token: URL_SAFE_NO_PAD.encode(bytes),
            redirect,
            provider_id,
            op,
        })
    }

    /// # Errors
    /// Returns an error if the state cannot be serialized.
    pub fn encode(&self) -> Result<String, LoginStateError> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// # Errors
    /// Returns an error for anything that did not come out of [`Self::encode`].
    pub fn decode(encoded: &str) -> Result<Self, LoginStateError> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// State cookie of one provider family.
#[derive(Clone, Copy, Debug)]
pub struct StateCookie {
    family: &'static str,
    secure: bool,
    same_site: SameSite,
}

impl StateCookie {
    /// Same-site navigation (OAuth and OIDC redirect back with a GET).
    #[must_use]
    pub const fn lax(family: &'static str, secure: bool) -> Self {
        Self {
            family,
            secure,
            same_site: SameSite::Lax,
        }
    }

    /// Cross-site POST (SAML HTTP-POST binding). Browsers only send such a
    /// cookie with `SameSite=None`, which in turn requires `Secure`; plain
    /// http works for localhost only.
    #[must_use]
    pub const fn cross_site(family: &'static str) -> Self {
        Self {
            family,
            secure: true,
            same_site: SameSite::None,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-state-cookie", self.family)
    }

    /// # Errors
    /// Returns an error if the value is not a valid header.
    pub fn set(&self, encoded_state: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        build_cookie(
            &self.name(),
            encoded_state,
            STATE_COOKIE_MAX_AGE_SECONDS,
            self.secure,
            self.same_site,
        )
    }

    /// # Errors
    /// Returns an error if the value is not a valid header.
    pub fn clear(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        clear_cookie(&self.name(), self.secure, self.same_site)
    }

    #[must_use]
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        cookie_value(headers, &self.name()).filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() -> anyhow::Result<()> {
        let state = LoginState::new(
            "/search?q=x".to_string(),
            ConfigId::new("github", "abc"),
            LoginOp::LinkAccount,
        )?;
        let encoded = state.encode()?;
        assert!(!encoded.contains('='));
        assert_eq!(LoginState::decode(&encoded)?, state);
        Ok(())
    }

    #[test]
    fn csrf_tokens_are_random() -> anyhow::Result<()> {
        let a = LoginState::new("/".to_string(), ConfigId::new("github", "a"), LoginOp::Login)?;
        let b = LoginState::new("/".to_string(), ConfigId::new("github", "a"), LoginOp::Login)?;
        assert_ne!(a.csrf_token, b.csrf_token);
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            LoginState::decode("not base64!"),
            Err(LoginStateError::Encoding(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"{nope");
        assert!(matches!(
            LoginState::decode(&not_json),
            Err(LoginStateError::Json(_))
        ));
    }

    #[test]
    fn op_defaults_to_login() -> anyhow::Result<()> {
        let encoded = URL_SAFE_NO_PAD
            .encode(br#"{"csrf":"t","redirect":"/","pid":{"type":"saml","id":"x"}}"#);
        assert_eq!(LoginState::decode(&encoded)?.op, LoginOp::Login);
        Ok(())
    }

    #[test]
    fn state_cookie_attributes() -> anyhow::Result<()> {
        let cookie = StateCookie::cross_site("saml").set("abc")?;
        assert_eq!(
            cookie.to_str()?,
            "saml-state-cookie=abc; Path=/; HttpOnly; SameSite=None; Max-Age=900; Secure"
        );
        let cleared = StateCookie::cross_site("saml").clear()?;
        assert_eq!(
            cleared.to_str()?,
            "saml-state-cookie=; Path=/; HttpOnly; SameSite=None; Max-Age=0; Secure"
        );
        let cleared = StateCookie::lax("github", false).clear()?;
        assert_eq!(
            cleared.to_str()?,
            "github-state-cookie=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"
        );
        Ok(())
    }
}
