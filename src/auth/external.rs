//! Narrow interfaces to collaborators outside the authentication core.
//!
//! Permission syncing, security event logging and license checks are owned
//! by other subsystems. The core only calls them through these traits; the
//! log-only implementations are used in development and tests.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Permission bootstrap for freshly created accounts.
#[async_trait]
pub trait PermissionSyncer: Send + Sync {
    /// Queue a permission sync for `user_id`.
    async fn schedule_user_sync(&self, user_id: i32, reason: &str) -> Result<()>;

    /// Grant repository permissions that were recorded before the user existed.
    async fn grant_pending_permissions(&self, user_id: i32) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogPermissionSyncer;

#[async_trait]
impl PermissionSyncer for LogPermissionSyncer {
    async fn schedule_user_sync(&self, user_id: i32, reason: &str) -> Result<()> {
        info!(user_id, reason, "permission sync scheduled");
        Ok(())
    }

    async fn grant_pending_permissions(&self, user_id: i32) -> Result<()> {
        info!(user_id, "pending permissions granted");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEventName {
    ExternalAuthSignupSucceeded,
    ExternalAuthSignupFailed,
    SignInSucceeded,
    SignInFailed,
    SignOutSucceeded,
}

impl SecurityEventName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExternalAuthSignupSucceeded => "ExternalAuthSignupSucceeded",
            Self::ExternalAuthSignupFailed => "ExternalAuthSignupFailed",
            Self::SignInSucceeded => "SignInSucceeded",
            Self::SignInFailed => "SignInFailed",
            Self::SignOutSucceeded => "SignOutSucceeded",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SecurityEvent {
    pub name: SecurityEventName,
    pub user_id: Option<i32>,
    pub service_type: String,
    /// Free-form, never contains secrets.
    pub detail: String,
}

#[async_trait]
pub trait EventLogger: Send + Sync {
    async fn log_security_event(&self, event: SecurityEvent) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogEventLogger;

#[async_trait]
impl EventLogger for LogEventLogger {
    async fn log_security_event(&self, event: SecurityEvent) -> Result<()> {
        info!(
            event = event.name.as_str(),
            user_id = ?event.user_id,
            service_type = %event.service_type,
            detail = %event.detail,
            "security event"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    /// Single sign-on through OpenID Connect or SAML.
    Sso,
}

pub trait Licensing: Send + Sync {
    fn check_feature(&self, feature: Feature) -> bool;
}

#[derive(Clone, Debug)]
pub struct AllowAllLicensing;

impl Licensing for AllowAllLicensing {
    fn check_feature(&self, _feature: Feature) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_implementations_succeed() -> Result<()> {
        LogPermissionSyncer.schedule_user_sync(1, "signup").await?;
        LogPermissionSyncer.grant_pending_permissions(1).await?;
        LogEventLogger
            .log_security_event(SecurityEvent {
                name: SecurityEventName::SignInSucceeded,
                user_id: Some(1),
                service_type: "builtin".to_string(),
                detail: String::new(),
            })
            .await?;
        assert!(AllowAllLicensing.check_feature(Feature::Sso));
        Ok(())
    }
}
