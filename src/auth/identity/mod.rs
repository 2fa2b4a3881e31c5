//! Mapping external identities to local users.

mod memory;
mod pg;
mod store;
mod username;

pub use memory::MemoryUserStore;
pub use pg::PgUserStore;
pub use store::{
    AssociateError, CreateUserError, ExternalAccountData, ExternalAccountSpec, NewUser, User,
    UserStore,
};
pub use username::{hash_password, normalize_username};

use std::sync::Arc;
use tracing::{info, warn};

use super::{
    actor::Actor,
    external::{SecurityEvent, SecurityEventName},
    state::AuthState,
};

/// Account resolution failure: a curated message for the user and the
/// underlying diagnostic for the logs.
#[derive(Debug, thiserror::Error)]
#[error("{safe_message}")]
pub struct ResolveError {
    safe_message: String,
    #[source]
    source: anyhow::Error,
}

impl ResolveError {
    fn new(safe_message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            safe_message: safe_message.into(),
            source,
        }
    }

    #[must_use]
    pub fn safe_message(&self) -> &str {
        &self.safe_message
    }
}

/// Everything identity resolution needs to know about one sign-in.
#[derive(Clone, Debug)]
pub struct GetAndSaveUserOp {
    pub user_props: NewUser,
    pub external_account: ExternalAccountSpec,
    pub external_account_data: ExternalAccountData,
    pub create_if_not_exist: bool,
    pub lookup_by_username: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedUser {
    pub user_id: i32,
    pub new_user: bool,
}

const LOOKUP_FAILED: &str = "Unexpected error looking up the user account associated with the external account. Ask a site admin for help.";
const SIGNUP_NOT_ALLOWED: &str =
    "We couldn't find a matching account and signup is not allowed. Ask a site admin for help.";
const USERNAME_TAKEN: &str = "A user with that username already exists, and no verified email address matched. Ask a site admin for help.";
const CREATE_FAILED: &str =
    "Unable to create a new user account due to an unexpected error. Ask a site admin for help.";
const LINK_FAILED: &str =
    "Unexpected error associating the external account with your user account. Ask a site admin for help.";
const ALREADY_LINKED: &str = "Unable to link the external account to your user account because another user is already linked to it. Unlink it from the other user first.";

/// Resolve the local user for an external sign-in, creating and linking as
/// needed.
///
/// An already authenticated actor always wins: the external account is
/// linked to that user instead of looked up.
///
/// # Errors
/// Returns a [`ResolveError`] whose message is safe to show to the user.
pub async fn get_and_save_user(
    state: &AuthState,
    actor: &Actor,
    op: GetAndSaveUserOp,
) -> Result<ResolvedUser, ResolveError> {
    let result = resolve(state, actor, &op).await;
    if let Err(err) = &result {
        state.record_event(SecurityEvent {
            name: SecurityEventName::ExternalAuthSignupFailed,
            user_id: None,
            service_type: op.external_account.service_type.clone(),
            detail: err.safe_message().to_string(),
        });
    }
    result
}

async fn resolve(
    state: &AuthState,
    actor: &Actor,
    op: &GetAndSaveUserOp,
) -> Result<ResolvedUser, ResolveError> {
    let users = state.users();
    let spec = &op.external_account;
    let data = &op.external_account_data;

    let (user_id, saved, new_user) = if actor.is_authenticated() {
        (actor.uid, false, false)
    } else {
        match users.lookup_user_and_save(spec, data).await {
            Ok(Some(user_id)) => (user_id, true, false),
            Ok(None) => find_or_create(state, op).await?,
            Err(err) => return Err(ResolveError::new(LOOKUP_FAILED, err)),
        }
    };

    if !new_user {
        if let Err(err) = users
            .update_profile_if_empty(
                user_id,
                &op.user_props.display_name,
                &op.user_props.avatar_url,
            )
            .await
        {
            warn!(user_id, "Failed to update user profile: {err:#}");
        }
    }

    if !saved {
        match users.associate_user_and_save(user_id, spec, data).await {
            Ok(()) => {}
            Err(AssociateError::AlreadyLinked { other_user_id }) => {
                return Err(ResolveError::new(
                    ALREADY_LINKED,
                    anyhow::anyhow!(
                        "external account {}:{} is linked to user {other_user_id}, not {user_id}",
                        spec.service_type,
                        spec.account_id
                    ),
                ));
            }
            Err(AssociateError::Other(err)) => return Err(ResolveError::new(LINK_FAILED, err)),
        }
    }

    Ok(ResolvedUser { user_id, new_user })
}

/// Returns `(user_id, external_account_saved, newly_created)`.
async fn find_or_create(
    state: &AuthState,
    op: &GetAndSaveUserOp,
) -> Result<(i32, bool, bool), ResolveError> {
    let users = state.users();
    let props = &op.user_props;

    let existing = if op.lookup_by_username {
        users.get_by_username(&props.username).await
    } else if props.email_is_verified {
        match props.email.as_deref() {
            Some(email) => users.get_by_verified_email(email).await,
            None => Ok(None),
        }
    } else {
        Ok(None)
    };
    match existing {
        Ok(Some(user)) => return Ok((user.id, false, false)),
        Ok(None) => {}
        Err(err) => return Err(ResolveError::new(LOOKUP_FAILED, err)),
    }

    if !op.create_if_not_exist {
        return Err(ResolveError::new(
            SIGNUP_NOT_ALLOWED,
            anyhow::anyhow!(
                "no user matches external account {}:{} and signup is disabled",
                op.external_account.service_type,
                op.external_account.account_id
            ),
        ));
    }

    let created = users
        .create_user_and_save(props, &op.external_account, &op.external_account_data)
        .await
        .map_err(|err| match err {
            CreateUserError::UsernameExists => ResolveError::new(
                USERNAME_TAKEN,
                anyhow::anyhow!("username {:?} already exists", props.username),
            ),
            CreateUserError::Presentation(message) => {
                ResolveError::new(message.clone(), anyhow::anyhow!(message))
            }
            CreateUserError::EmailExists => {
                ResolveError::new(CREATE_FAILED, anyhow::anyhow!("email already exists"))
            }
            CreateUserError::Other(err) => ResolveError::new(CREATE_FAILED, err),
        })?;

    let service_type = op.external_account.service_type.clone();
    let actor = Actor::internal_user(
        created.id,
        service_type == state.config().operator_service_type(),
    );
    info!(
        user_id = created.id,
        operator = actor.operator,
        service_type = %service_type,
        "created user from external account"
    );

    let perms = Arc::clone(state.permissions());
    tokio::spawn(async move {
        if let Err(err) = perms.grant_pending_permissions(actor.uid).await {
            warn!(user_id = actor.uid, "Failed to grant pending permissions: {err:#}");
        }
        if let Err(err) = perms.schedule_user_sync(actor.uid, "user created").await {
            warn!(user_id = actor.uid, "Failed to schedule permission sync: {err:#}");
        }
    });
    state.record_event(SecurityEvent {
        name: SecurityEventName::ExternalAuthSignupSucceeded,
        user_id: Some(created.id),
        service_type,
        detail: String::new(),
    });

    Ok((created.id, true, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::memory_state;
    use anyhow::Result;

    fn spec(account_id: &str) -> ExternalAccountSpec {
        ExternalAccountSpec {
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string(),
            client_id: "client".to_string(),
            account_id: account_id.to_string(),
        }
    }

    fn op(username: &str, account_id: &str, create: bool) -> GetAndSaveUserOp {
        GetAndSaveUserOp {
            user_props: NewUser {
                username: username.to_string(),
                email: Some(format!("{username}@example.com")),
                email_is_verified: true,
                display_name: "Display".to_string(),
                avatar_url: "https://avatar".to_string(),
            },
            external_account: spec(account_id),
            external_account_data: ExternalAccountData::default(),
            create_if_not_exist: create,
            lookup_by_username: false,
        }
    }

    #[tokio::test]
    async fn creates_then_finds_by_external_account() -> Result<()> {
        let (state, _) = memory_state();
        let first = get_and_save_user(&state, &Actor::anonymous(), op("alice", "1", true)).await?;
        assert!(first.new_user);

        let second =
            get_and_save_user(&state, &Actor::anonymous(), op("alice", "1", false)).await?;
        assert_eq!(second.user_id, first.user_id);
        assert!(!second.new_user);
        Ok(())
    }

    #[tokio::test]
    async fn signup_disabled_without_match() {
        let (state, _) = memory_state();
        let err = get_and_save_user(&state, &Actor::anonymous(), op("bob", "2", false)).await;
        assert_eq!(err.err().map(|e| e.safe_message().to_string()).as_deref(), Some(SIGNUP_NOT_ALLOWED));
    }

    #[tokio::test]
    async fn matches_existing_user_by_verified_email() -> Result<()> {
        let (state, users) = memory_state();
        let existing = users
            .insert_user(&NewUser {
                username: "carol".to_string(),
                email: Some("carol@example.com".to_string()),
                email_is_verified: true,
                ..NewUser::default()
            })
            .map_err(|err| anyhow::anyhow!(err))?;

        let resolved =
            get_and_save_user(&state, &Actor::anonymous(), op("carol", "3", false)).await?;
        assert_eq!(resolved.user_id, existing.id);
        assert_eq!(users.linked_user(&spec("3")), Some(existing.id));

        let stored = users.get_by_id(existing.id).await?;
        assert_eq!(stored.map(|u| u.display_name), Some("Display".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn username_collision_has_curated_message() -> Result<()> {
        let (state, users) = memory_state();
        users
            .insert_user(&NewUser {
                username: "dave".to_string(),
                email: Some("dave@elsewhere.example".to_string()),
                ..NewUser::default()
            })
            .map_err(|err| anyhow::anyhow!(err))?;
        let err = get_and_save_user(&state, &Actor::anonymous(), op("dave", "4", true)).await;
        assert_eq!(err.err().map(|e| e.safe_message().to_string()).as_deref(), Some(USERNAME_TAKEN));
        Ok(())
    }

    #[tokio::test]
    async fn authenticated_actor_takes_precedence() -> Result<()> {
        let (state, users) = memory_state();
        let alice = get_and_save_user(&state, &Actor::anonymous(), op("alice", "1", true)).await?;
        let bob = users
            .insert_user(&NewUser {
                username: "bob".to_string(),
                ..NewUser::default()
            })
            .map_err(|err| anyhow::anyhow!(err))?;

        // Signed in as bob, presenting a new external account that would
        // otherwise match alice by email: it is linked to bob.
        let resolved =
            get_and_save_user(&state, &Actor::from_user(bob.id), op("alice", "9", false)).await?;
        assert_eq!(resolved.user_id, bob.id);
        assert_ne!(resolved.user_id, alice.user_id);
        assert_eq!(users.linked_user(&spec("9")), Some(bob.id));
        Ok(())
    }

    #[tokio::test]
    async fn refuses_to_relink_another_users_account() -> Result<()> {
        let (state, users) = memory_state();
        let alice = get_and_save_user(&state, &Actor::anonymous(), op("alice", "1", true)).await?;
        let mallory = users
            .insert_user(&NewUser {
                username: "mallory".to_string(),
                ..NewUser::default()
            })
            .map_err(|err| anyhow::anyhow!(err))?;

        let err =
            get_and_save_user(&state, &Actor::from_user(mallory.id), op("alice", "1", false)).await;
        assert_eq!(err.err().map(|e| e.safe_message().to_string()).as_deref(), Some(ALREADY_LINKED));
        assert_eq!(users.linked_user(&spec("1")), Some(alice.user_id));
        Ok(())
    }
}
