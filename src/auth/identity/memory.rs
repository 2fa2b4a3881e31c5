//! In-process user store used when no database is configured and in tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use super::{
    store::{
        AssociateError, CreateUserError, ExternalAccountData, ExternalAccountSpec, NewUser, User,
        UserStore,
    },
    username::{hash_password, normalize_email, verify_password},
};

#[derive(Default)]
struct Inner {
    next_id: i32,
    users: HashMap<i32, User>,
    passwords: HashMap<i32, String>,
    accounts: HashMap<ExternalAccountSpec, (i32, ExternalAccountData)>,
}

impl Inner {
    fn find(&self, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.users.values().find(|user| pred(user)).cloned()
    }

    fn insert(&mut self, user: &NewUser) -> Result<User, CreateUserError> {
        if user.username.trim().is_empty() {
            return Err(CreateUserError::Presentation(
                "The username must not be empty.".to_string(),
            ));
        }
        if self
            .users
            .values()
            .any(|existing| existing.username.eq_ignore_ascii_case(&user.username))
        {
            return Err(CreateUserError::UsernameExists);
        }
        let email = user.email.as_deref().map(normalize_email);
        if let Some(email) = &email {
            if self
                .users
                .values()
                .any(|existing| existing.email.as_deref() == Some(email.as_str()))
            {
                return Err(CreateUserError::EmailExists);
            }
        }

        self.next_id += 1;
        let created = User {
            id: self.next_id,
            username: user.username.clone(),
            email,
            email_verified: user.email_is_verified,
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            created_at: Utc::now(),
            invalidated_sessions_at: None,
        };
        self.users.insert(created.id, created.clone());
        Ok(created)
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<Inner>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create a local user without an external account.
    ///
    /// # Errors
    /// Returns an error if the user conflicts with an existing one.
    pub fn insert_user(&self, user: &NewUser) -> Result<User, CreateUserError> {
        self.lock().insert(user)
    }

    /// Create a local user that can sign in with the builtin provider.
    ///
    /// # Errors
    /// Returns an error if hashing fails or the user conflicts with an existing one.
    pub fn insert_user_with_password(
        &self,
        user: &NewUser,
        password: &str,
    ) -> Result<User, CreateUserError> {
        let hash = hash_password(password)?;
        let mut inner = self.lock();
        let created = inner.insert(user)?;
        inner.passwords.insert(created.id, hash);
        Ok(created)
    }

    /// User currently linked to `spec`, if any.
    #[must_use]
    pub fn linked_user(&self, spec: &ExternalAccountSpec) -> Option<i32> {
        self.lock().accounts.get(spec).map(|(user_id, _)| *user_id)
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_id(&self, id: i32) -> Result<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .lock()
            .find(|user| user.username.eq_ignore_ascii_case(username)))
    }

    async fn get_by_verified_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        Ok(self.lock().find(|user| {
            user.email_verified && user.email.as_deref() == Some(email.as_str())
        }))
    }

    async fn lookup_user_and_save(
        &self,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<Option<i32>> {
        let mut inner = self.lock();
        Ok(inner.accounts.get_mut(spec).map(|(user_id, stored)| {
            *stored = data.clone();
            *user_id
        }))
    }

    async fn create_user_and_save(
        &self,
        user: &NewUser,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<User, CreateUserError> {
        let mut inner = self.lock();
        if let Some((other_user_id, _)) = inner.accounts.get(spec) {
            return Err(CreateUserError::Other(anyhow::anyhow!(
                "external account already linked to user {other_user_id}"
            )));
        }
        let created = inner.insert(user)?;
        inner
            .accounts
            .insert(spec.clone(), (created.id, data.clone()));
        Ok(created)
    }

    async fn associate_user_and_save(
        &self,
        user_id: i32,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<(), AssociateError> {
        let mut inner = self.lock();
        if !inner.users.contains_key(&user_id) {
            return Err(AssociateError::Other(anyhow::anyhow!(
                "user {user_id} does not exist"
            )));
        }
        match inner.accounts.get(spec) {
            Some((other_user_id, _)) if *other_user_id != user_id => {
                Err(AssociateError::AlreadyLinked {
                    other_user_id: *other_user_id,
                })
            }
            _ => {
                inner.accounts.insert(spec.clone(), (user_id, data.clone()));
                Ok(())
            }
        }
    }

    async fn update_profile_if_empty(
        &self,
        user_id: i32,
        display_name: &str,
        avatar_url: &str,
    ) -> Result<()> {
        if let Some(user) = self.lock().users.get_mut(&user_id) {
            if user.display_name.is_empty() {
                user.display_name = display_name.to_string();
            }
            if user.avatar_url.is_empty() {
                user.avatar_url = avatar_url.to_string();
            }
        }
        Ok(())
    }

    async fn invalidate_sessions(&self, ids: &[i32]) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        for id in ids {
            if let Some(user) = inner.users.get_mut(id) {
                user.invalidated_sessions_at = Some(match user.invalidated_sessions_at {
                    Some(previous) if previous > now => previous,
                    _ => now,
                });
            }
        }
        Ok(())
    }

    async fn check_password(&self, login: &str, password: &str) -> Result<Option<User>> {
        let inner = self.lock();
        let login_email = normalize_email(login);
        let Some(user) = inner.find(|user| {
            user.username.eq_ignore_ascii_case(login)
                || user.email.as_deref() == Some(login_email.as_str())
        }) else {
            return Ok(None);
        };
        let matches = inner
            .passwords
            .get(&user.id)
            .is_some_and(|hash| verify_password(hash, password));
        Ok(matches.then_some(user))
    }
}
