//! User and external-account persistence interface.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Local user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    /// Sessions last active before this instant are revoked.
    pub invalidated_sessions_at: Option<DateTime<Utc>>,
}

/// Stable link between a local user and an account at an external source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalAccountSpec {
    pub service_type: String,
    pub service_id: String,
    pub client_id: String,
    pub account_id: String,
}

/// Data stored alongside an external account link.
///
/// `auth_data` holds only what is needed to later refresh or revoke a token,
/// never the raw token response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalAccountData {
    pub auth_data: Option<Value>,
    pub account_data: Option<Value>,
}

/// Profile asserted by the external source, used when creating a user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub email_is_verified: bool,
    pub display_name: String,
    pub avatar_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateUserError {
    #[error("username already exists")]
    UsernameExists,

    #[error("email already exists")]
    EmailExists,

    /// Validation failure whose message is safe to show to the user.
    #[error("{0}")]
    Presentation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AssociateError {
    #[error("external account is already linked to user {other_user_id}")]
    AlreadyLinked { other_user_id: i32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence collaborator for identity resolution and session checks.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: i32) -> Result<Option<User>>;

    async fn get_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn get_by_verified_email(&self, email: &str) -> Result<Option<User>>;

    /// Find the user linked to `spec` and refresh the stored account data.
    async fn lookup_user_and_save(
        &self,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<Option<i32>>;

    /// Create a user and link `spec` to it in one step.
    async fn create_user_and_save(
        &self,
        user: &NewUser,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<User, CreateUserError>;

    /// Link `spec` to `user_id` (or refresh the data of an existing link).
    /// Fails without touching anything when `spec` belongs to another user.
    async fn associate_user_and_save(
        &self,
        user_id: i32,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<(), AssociateError>;

    /// Fill `display_name` and `avatar_url`, but only where currently empty.
    async fn update_profile_if_empty(
        &self,
        user_id: i32,
        display_name: &str,
        avatar_url: &str,
    ) -> Result<()>;

    /// Advance the session invalidation watermark of every user in `ids`.
    async fn invalidate_sessions(&self, ids: &[i32]) -> Result<()>;

    /// Builtin password check by username or email.
    async fn check_password(&self, login: &str, password: &str) -> Result<Option<User>>;
}
