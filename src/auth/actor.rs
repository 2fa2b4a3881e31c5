//! Request-scoped caller identity.

use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use utoipa::ToSchema;

/// The resolved caller for one request: a user, or anonymous (`uid == 0`).
///
/// Inserted into the request extensions by the session middleware (or an
/// identity wrapper such as the HTTP-header provider) and never mutated
/// afterwards. Handlers read it with the extractor below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Actor {
    pub uid: i32,
    /// Set for actors synthesized by the server itself (e.g. right after signup).
    #[serde(default)]
    pub internal: bool,
    /// Operator-class account, signed in through the operator provider type.
    #[serde(default)]
    pub operator: bool,
    #[serde(skip)]
    pub from_session_cookie: bool,
}

impl Actor {
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            uid: 0,
            internal: false,
            operator: false,
            from_session_cookie: false,
        }
    }

    #[must_use]
    pub const fn from_user(uid: i32) -> Self {
        Self {
            uid,
            internal: false,
            operator: false,
            from_session_cookie: false,
        }
    }

    #[must_use]
    pub const fn internal_user(uid: i32, operator: bool) -> Self {
        Self {
            uid,
            internal: true,
            operator,
            from_session_cookie: false,
        }
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.uid != 0
    }
}

/// Per-request opt-in that lets an otherwise protected route through the
/// require-auth policy. Layers that serve public content insert it.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousAccess;

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn anonymous_is_not_authenticated() {
        assert!(!Actor::anonymous().is_authenticated());
        assert!(!Actor::default().is_authenticated());
        assert!(Actor::from_user(7).is_authenticated());
    }

    #[test]
    fn internal_user_carries_operator_flag() {
        let actor = Actor::internal_user(3, true);
        assert!(actor.internal);
        assert!(actor.operator);
        assert_eq!(actor.uid, 3);
    }

    #[tokio::test]
    async fn extractor_defaults_to_anonymous() {
        let (mut parts, ()) = Request::builder().body(()).unwrap_or_default().into_parts();
        let actor = Actor::from_request_parts(&mut parts, &()).await;
        assert_eq!(actor, Ok(Actor::anonymous()));

        parts.extensions.insert(Actor::from_user(42));
        let actor = Actor::from_request_parts(&mut parts, &()).await;
        assert_eq!(actor, Ok(Actor::from_user(42)));
    }
}
