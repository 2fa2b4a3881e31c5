//! Server-side sessions addressed by an opaque cookie token.
//!
//! The cookie carries 32 random bytes; the backend only ever sees
//! `SHA-256(secret || token)`. A session is valid while it has not expired,
//! its user still exists, it was last active after the user's invalidation
//! watermark and the user's creation time still matches the one recorded at
//! sign-in (so a deleted-and-recreated user id does not inherit sessions).

mod backend;
mod pg;

pub use backend::{MemorySessionBackend, SessionBackend};
pub use pg::PgSessionBackend;

use anyhow::Context;
use axum::http::{
    HeaderMap, HeaderValue,
    header::{InvalidHeaderValue, SET_COOKIE},
};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

use super::{
    actor::Actor,
    cookies::{
        SESSION_COOKIE, SIGN_OUT_COOKIE, SIGN_OUT_MAX_AGE_SECONDS, SameSite, build_cookie,
        clear_cookie, cookie_value,
    },
    error::AuthError,
    identity::UserStore,
};

/// Largest serialized value accepted by [`SessionStore::set_data`].
pub const MAX_DATA_BYTES: usize = 4096;

/// Sessions idle longer than this get their `last_active` bumped.
const RENEW_AFTER_SECONDS: i64 = 5 * 60;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session backend failure")]
    Backend(#[from] anyhow::Error),

    #[error("no active session")]
    NoSession,

    #[error("session value of {len} bytes exceeds {MAX_DATA_BYTES} bytes")]
    DataTooLarge { len: usize },

    #[error("failed to encode session value")]
    Encode(#[from] serde_json::Error),

    #[error("invalid session cookie")]
    Cookie(#[from] InvalidHeaderValue),
}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        Self::Infrastructure(anyhow::Error::new(err))
    }
}

/// Raw session token as found in (or about to be written to) the cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCookie(String);

impl SessionCookie {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        cookie_value(headers, SESSION_COOKIE)
            .filter(|token| !token.is_empty())
            .map(Self)
    }

    fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate session token")?;
        Ok(Self(
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
        ))
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCookie(<redacted>)")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionRecord {
    actor: Actor,
    last_active: DateTime<Utc>,
    expiry_seconds: i64,
    user_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

impl SessionRecord {
    /// Out-of-range lifetimes count as already expired.
    fn expires_at(&self) -> DateTime<Utc> {
        Duration::try_seconds(self.expiry_seconds)
            .and_then(|expiry| self.last_active.checked_add_signed(expiry))
            .unwrap_or(self.last_active)
    }

    fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at() - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Result of reading the session cookie of one request.
#[derive(Debug, Default)]
pub struct Authenticated {
    pub actor: Actor,
    pub cookie: Option<SessionCookie>,
    /// `Set-Cookie` values to attach to the response.
    pub set_cookies: Vec<HeaderValue>,
}

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    users: Arc<dyn UserStore>,
    secret: SecretString,
    default_expiry: Duration,
    secure: bool,
}

impl SessionStore {
    #[must_use]
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        users: Arc<dyn UserStore>,
        secret: SecretString,
        default_expiry: Duration,
        secure: bool,
    ) -> Self {
        Self {
            backend,
            users,
            secret,
            default_expiry,
            secure,
        }
    }

    #[must_use]
    pub fn default_expiry(&self) -> Duration {
        self.default_expiry
    }

    fn storage_key(&self, cookie: &SessionCookie) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.expose_secret().as_bytes());
        hasher.update(cookie.token().as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn session_cookie(
        &self,
        cookie: &SessionCookie,
        expiry: Duration,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        build_cookie(
            SESSION_COOKIE,
            cookie.token(),
            expiry.num_seconds(),
            self.secure,
            SameSite::cross_site(self.secure),
        )
    }

    fn clear_session_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        clear_cookie(SESSION_COOKIE, self.secure, SameSite::cross_site(self.secure))
    }

    /// Marker cookie set on sign-out.
    ///
    /// # Errors
    /// Returns an error if the header value cannot be built.
    pub fn sign_out_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        build_cookie(
            SIGN_OUT_COOKIE,
            "true",
            SIGN_OUT_MAX_AGE_SECONDS,
            self.secure,
            SameSite::Lax,
        )
    }

    async fn load(&self, key: &str) -> Result<Option<SessionRecord>, SessionError> {
        let Some(raw) = self.backend.load(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!("Discarding corrupt session record: {err}");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, record: &SessionRecord) -> Result<(), SessionError> {
        let value = serde_json::to_vec(record)?;
        self.backend
            .store(key, &value, record.remaining(Utc::now()))
            .await?;
        Ok(())
    }

    /// Resolve the actor for a request from its session cookie.
    ///
    /// A missing, expired, corrupt or revoked session yields the anonymous
    /// actor plus a cookie that clears the stale token. Only an unavailable
    /// backend is an error.
    ///
    /// # Errors
    /// Returns [`SessionError::Backend`] when the backend or user store fails.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Authenticated, SessionError> {
        let Some(cookie) = SessionCookie::from_headers(headers) else {
            return Ok(Authenticated::default());
        };
        let key = self.storage_key(&cookie);

        let Some(mut record) = self.load(&key).await? else {
            return Ok(Authenticated {
                set_cookies: vec![self.clear_session_cookie()?],
                ..Authenticated::default()
            });
        };

        let now = Utc::now();
        if let Some(reason) = self.invalid_reason(&record, now).await? {
            debug!(uid = record.actor.uid, reason, "session rejected");
            self.backend.delete(&key).await?;
            return Ok(Authenticated {
                set_cookies: vec![self.clear_session_cookie()?],
                ..Authenticated::default()
            });
        }

        let mut set_cookies = Vec::new();
        if now - record.last_active > Duration::seconds(RENEW_AFTER_SECONDS) {
            record.last_active = now;
            self.save(&key, &record).await?;
            set_cookies.push(self.session_cookie(&cookie, record.expires_at() - now)?);
        }

        let mut actor = record.actor;
        actor.from_session_cookie = true;
        Ok(Authenticated {
            actor,
            cookie: Some(cookie),
            set_cookies,
        })
    }

    async fn invalid_reason(
        &self,
        record: &SessionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<&'static str>, SessionError> {
        if record.expires_at() <= now {
            return Ok(Some("expired"));
        }
        if !record.actor.is_authenticated() {
            return Ok(None);
        }
        let Some(user) = self.users.get_by_id(record.actor.uid).await? else {
            return Ok(Some("user no longer exists"));
        };
        if user
            .invalidated_sessions_at
            .is_some_and(|watermark| record.last_active < watermark)
        {
            return Ok(Some("invalidated"));
        }
        if record.user_created_at != Some(user.created_at) {
            return Ok(Some("user was recreated"));
        }
        Ok(None)
    }

    /// Replace the session of the current request.
    ///
    /// `None` signs out. Otherwise a fresh token is issued (the old record is
    /// deleted), `expiry` defaults to the store default and `user_created_at`
    /// to the user's stored creation time. A stale sign-out marker is removed.
    ///
    /// # Errors
    /// Returns an error if the backend or user store fails.
    pub async fn set_actor(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
        actor: Option<&Actor>,
        expiry: Option<Duration>,
        user_created_at: Option<DateTime<Utc>>,
    ) -> Result<Option<SessionCookie>, SessionError> {
        if let Some(previous) = SessionCookie::from_headers(request) {
            self.backend.delete(&self.storage_key(&previous)).await?;
        }

        let Some(actor) = actor else {
            response.append(SET_COOKIE, self.clear_session_cookie()?);
            return Ok(None);
        };

        let user_created_at = match user_created_at {
            Some(created_at) => Some(created_at),
            None if actor.is_authenticated() => self
                .users
                .get_by_id(actor.uid)
                .await?
                .map(|user| user.created_at),
            None => None,
        };
        let expiry = expiry.unwrap_or(self.default_expiry);
        let record = SessionRecord {
            actor: Actor {
                from_session_cookie: false,
                ..*actor
            },
            last_active: Utc::now(),
            expiry_seconds: expiry.num_seconds(),
            user_created_at,
            data: BTreeMap::new(),
        };

        let cookie = SessionCookie::generate()?;
        self.save(&self.storage_key(&cookie), &record).await?;
        response.append(SET_COOKIE, self.session_cookie(&cookie, expiry)?);
        if cookie_value(request, SIGN_OUT_COOKIE).is_some() {
            response.append(
                SET_COOKIE,
                clear_cookie(SIGN_OUT_COOKIE, self.secure, SameSite::Lax)?,
            );
        }
        Ok(Some(cookie))
    }

    /// Store `value` under `key` in the session.
    ///
    /// # Errors
    /// Returns [`SessionError::NoSession`] without a live session and
    /// [`SessionError::DataTooLarge`] past [`MAX_DATA_BYTES`].
    pub async fn set_data<T: Serialize>(
        &self,
        cookie: &SessionCookie,
        key: &str,
        value: &T,
    ) -> Result<(), SessionError> {
        let encoded = serde_json::to_vec(value)?;
        if encoded.len() > MAX_DATA_BYTES {
            return Err(SessionError::DataTooLarge { len: encoded.len() });
        }
        let storage_key = self.storage_key(cookie);
        let mut record = self
            .load(&storage_key)
            .await?
            .ok_or(SessionError::NoSession)?;
        record
            .data
            .insert(key.to_string(), serde_json::from_slice(&encoded)?);
        self.save(&storage_key, &record).await
    }

    /// Value previously stored under `key`, if any.
    ///
    /// # Errors
    /// Returns an error if the backend fails or the value does not decode as `T`.
    pub async fn get_data<T: DeserializeOwned>(
        &self,
        cookie: &SessionCookie,
        key: &str,
    ) -> Result<Option<T>, SessionError> {
        let Some(record) = self.load(&self.storage_key(cookie)).await? else {
            return Ok(None);
        };
        match record.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Revoke every session of the current user and clear this request's cookie.
    ///
    /// # Errors
    /// Returns an error if the backend or user store fails.
    pub async fn invalidate_session_current_user(
        &self,
        request: &HeaderMap,
        response: &mut HeaderMap,
        actor: &Actor,
    ) -> Result<(), SessionError> {
        if actor.is_authenticated() {
            self.users.invalidate_sessions(&[actor.uid]).await?;
        }
        self.set_actor(request, response, None, None, None).await?;
        Ok(())
    }

    /// Revoke every session of the given users.
    ///
    /// # Errors
    /// Returns an error if the user store fails.
    pub async fn invalidate_sessions_by_ids(&self, ids: &[i32]) -> Result<(), SessionError> {
        self.users.invalidate_sessions(ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::{MemoryUserStore, NewUser};
    use axum::http::header::COOKIE;

    struct Fixture {
        store: SessionStore,
        users: Arc<MemoryUserStore>,
        backend: Arc<MemorySessionBackend>,
    }

    fn fixture(secure: bool) -> Fixture {
        let users = Arc::new(MemoryUserStore::new());
        let backend = Arc::new(MemorySessionBackend::new());
        let store = SessionStore::new(
            backend.clone(),
            users.clone(),
            SecretString::from("test-secret"),
            Duration::hours(1),
            secure,
        );
        Fixture {
            store,
            users,
            backend,
        }
    }

    fn user(users: &MemoryUserStore, name: &str) -> anyhow::Result<i32> {
        let user = users
            .insert_user(&NewUser {
                username: name.to_string(),
                ..NewUser::default()
            })
            .map_err(|err| anyhow::anyhow!(err))?;
        Ok(user.id)
    }

    fn request_with(cookie: &SessionCookie) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={}", cookie.token())) {
            headers.insert(COOKIE, value);
        }
        headers
    }

    fn set_cookie_strings(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok().map(ToString::to_string))
            .collect()
    }

    async fn sign_in(fx: &Fixture, uid: i32) -> anyhow::Result<SessionCookie> {
        let mut response = HeaderMap::new();
        fx.store
            .set_actor(
                &HeaderMap::new(),
                &mut response,
                Some(&Actor::from_user(uid)),
                None,
                None,
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("no cookie issued"))
    }

    #[tokio::test]
    async fn set_read_and_clear() -> anyhow::Result<()> {
        let fx = fixture(false);
        let uid = user(&fx.users, "alice")?;
        let cookie = sign_in(&fx, uid).await?;

        let auth = fx.store.authenticate(&request_with(&cookie)).await?;
        assert_eq!(auth.actor.uid, uid);
        assert!(auth.actor.from_session_cookie);
        assert!(auth.set_cookies.is_empty());

        let mut response = HeaderMap::new();
        fx.store
            .set_actor(&request_with(&cookie), &mut response, None, None, None)
            .await?;
        assert!(set_cookie_strings(&response)[0].starts_with("sgs=; "));
        assert!(fx.backend.is_empty());

        let auth = fx.store.authenticate(&request_with(&cookie)).await?;
        assert!(!auth.actor.is_authenticated());
        assert_eq!(auth.set_cookies.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn set_actor_rotates_token_and_drops_sign_out_marker() -> anyhow::Result<()> {
        let fx = fixture(true);
        let uid = user(&fx.users, "alice")?;
        let first = sign_in(&fx, uid).await?;

        let mut request = request_with(&first);
        request.append(COOKIE, HeaderValue::from_static("sg-signout=true"));
        let mut response = HeaderMap::new();
        let second = fx
            .store
            .set_actor(&request, &mut response, Some(&Actor::from_user(uid)), None, None)
            .await?;
        assert!(second.as_ref().is_some_and(|second| *second != first));

        let cookies = set_cookie_strings(&response);
        assert!(cookies[0].contains("SameSite=None") && cookies[0].ends_with("Secure"));
        assert!(cookies.iter().any(|c| c.starts_with("sg-signout=; ")));

        let auth = fx.store.authenticate(&request_with(&first)).await?;
        assert!(!auth.actor.is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn expired_session_is_anonymous() -> anyhow::Result<()> {
        let fx = fixture(false);
        let uid = user(&fx.users, "alice")?;
        let mut response = HeaderMap::new();
        let cookie = fx
            .store
            .set_actor(
                &HeaderMap::new(),
                &mut response,
                Some(&Actor::from_user(uid)),
                Some(Duration::seconds(1)),
                None,
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("no cookie issued"))?;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let auth = fx.store.authenticate(&request_with(&cookie)).await?;
        assert!(!auth.actor.is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn forced_invalidation_revokes_existing_sessions() -> anyhow::Result<()> {
        let fx = fixture(false);
        let alice = user(&fx.users, "alice")?;
        let bob = user(&fx.users, "bob")?;
        let alice_cookie = sign_in(&fx, alice).await?;
        let bob_cookie = sign_in(&fx, bob).await?;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        fx.store.invalidate_sessions_by_ids(&[alice]).await?;

        let auth = fx.store.authenticate(&request_with(&alice_cookie)).await?;
        assert!(!auth.actor.is_authenticated());
        let auth = fx.store.authenticate(&request_with(&bob_cookie)).await?;
        assert_eq!(auth.actor.uid, bob);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let fresh = sign_in(&fx, alice).await?;
        let auth = fx.store.authenticate(&request_with(&fresh)).await?;
        assert_eq!(auth.actor.uid, alice);
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_current_user_clears_cookie() -> anyhow::Result<()> {
        let fx = fixture(false);
        let uid = user(&fx.users, "alice")?;
        let cookie = sign_in(&fx, uid).await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut response = HeaderMap::new();
        fx.store
            .invalidate_session_current_user(
                &request_with(&cookie),
                &mut response,
                &Actor::from_user(uid),
            )
            .await?;
        assert!(set_cookie_strings(&response)[0].starts_with("sgs=; "));
        let watermark = fx.users.get_by_id(uid).await?.and_then(|u| u.invalidated_sessions_at);
        assert!(watermark.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_creation_time_is_rejected() -> anyhow::Result<()> {
        let fx = fixture(false);
        let uid = user(&fx.users, "alice")?;
        let mut response = HeaderMap::new();
        let cookie = fx
            .store
            .set_actor(
                &HeaderMap::new(),
                &mut response,
                Some(&Actor::from_user(uid)),
                None,
                Some(Utc::now() - Duration::days(30)),
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("no cookie issued"))?;
        let auth = fx.store.authenticate(&request_with(&cookie)).await?;
        assert!(!auth.actor.is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn session_data_round_trip_and_limit() -> anyhow::Result<()> {
        let fx = fixture(false);
        let uid = user(&fx.users, "alice")?;
        let cookie = sign_in(&fx, uid).await?;

        fx.store.set_data(&cookie, "oauth", &serde_json::json!({"expiry": 10})).await?;
        let value: Option<Value> = fx.store.get_data(&cookie, "oauth").await?;
        assert_eq!(value, Some(serde_json::json!({"expiry": 10})));

        let big = "x".repeat(MAX_DATA_BYTES);
        let err = fx.store.set_data(&cookie, "big", &big).await;
        assert!(matches!(err, Err(SessionError::DataTooLarge { .. })));

        let missing: Option<Value> = fx.store.get_data(&cookie, "nope").await?;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_record_clears_cookie() -> anyhow::Result<()> {
        let fx = fixture(false);
        let cookie = SessionCookie("forged".to_string());
        fx.backend
            .store(
                &fx.store.storage_key(&cookie),
                b"not json",
                std::time::Duration::from_secs(60),
            )
            .await?;
        let auth = fx.store.authenticate(&request_with(&cookie)).await?;
        assert!(!auth.actor.is_authenticated());
        assert_eq!(auth.set_cookies.len(), 1);
        Ok(())
    }

    #[test]
    fn overflowing_lifetime_counts_as_expired() {
        let now = Utc::now();
        let record = SessionRecord {
            actor: Actor::from_user(1),
            last_active: now,
            expiry_seconds: i64::MAX,
            user_created_at: None,
            data: BTreeMap::new(),
        };
        assert_eq!(record.expires_at(), now);
        assert_eq!(record.remaining(now), std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn stored_record_with_huge_lifetime_is_rejected() -> anyhow::Result<()> {
        let fx = fixture(false);
        let uid = user(&fx.users, "alice")?;
        let cookie = SessionCookie("huge".to_string());
        let record = SessionRecord {
            actor: Actor::from_user(uid),
            last_active: Utc::now(),
            expiry_seconds: i64::MAX,
            user_created_at: None,
            data: BTreeMap::new(),
        };
        fx.backend
            .store(
                &fx.store.storage_key(&cookie),
                &serde_json::to_vec(&record)?,
                std::time::Duration::from_secs(60),
            )
            .await?;
        let auth = fx.store.authenticate(&request_with(&cookie)).await?;
        assert!(!auth.actor.is_authenticated());
        assert_eq!(auth.set_cookies.len(), 1);
        Ok(())
    }
}
