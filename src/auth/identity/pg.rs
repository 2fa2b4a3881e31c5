//! Postgres-backed user store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;

use super::{
    store::{
        AssociateError, CreateUserError, ExternalAccountData, ExternalAccountSpec, NewUser, User,
        UserStore,
    },
    username::{normalize_email, verify_password},
};

const USER_COLUMNS: &str = "id, username, email, email_verified, display_name, avatar_url, created_at, invalidated_sessions_at";

fn is_unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            Some(db_err.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        email_verified: row.get("email_verified"),
        display_name: row.get("display_name"),
        avatar_url: row.get("avatar_url"),
        created_at: row.get("created_at"),
        invalidated_sessions_at: row.get("invalidated_sessions_at"),
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_user(&self, filter: &str, value: &str) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE {filter} LIMIT 1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;
        Ok(row.as_ref().map(user_from_row))
    }
}

async fn upsert_account(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: i32,
    spec: &ExternalAccountSpec,
    data: &ExternalAccountData,
) -> Result<(), AssociateError> {
    // The WHERE on the conflict branch keeps another user's link untouched;
    // no row comes back in that case.
    let query = r"
        INSERT INTO user_external_accounts
            (user_id, service_type, service_id, client_id, account_id, auth_data, account_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (service_type, service_id, client_id, account_id) DO UPDATE
        SET auth_data = EXCLUDED.auth_data,
            account_data = EXCLUDED.account_data,
            updated_at = NOW()
        WHERE user_external_accounts.user_id = EXCLUDED.user_id
        RETURNING user_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(&spec.service_type)
        .bind(&spec.service_id)
        .bind(&spec.client_id)
        .bind(&spec.account_id)
        .bind(&data.auth_data)
        .bind(&data.account_data)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to save external account")?;
    if row.is_some() {
        return Ok(());
    }

    let query = r"
        SELECT user_id FROM user_external_accounts
        WHERE service_type = $1 AND service_id = $2 AND client_id = $3 AND account_id = $4
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let other_user_id: i32 = sqlx::query(query)
        .bind(&spec.service_type)
        .bind(&spec.service_id)
        .bind(&spec.client_id)
        .bind(&spec.account_id)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to lookup external account owner")?
        .get("user_id");
    Err(AssociateError::AlreadyLinked { other_user_id })
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_by_id(&self, id: i32) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        self.fetch_user("lower(username) = lower($1)", username).await
    }

    async fn get_by_verified_email(&self, email: &str) -> Result<Option<User>> {
        self.fetch_user("email = $1 AND email_verified", &normalize_email(email))
            .await
    }

    async fn lookup_user_and_save(
        &self,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<Option<i32>> {
        let query = r"
            UPDATE user_external_accounts
            SET auth_data = $5, account_data = $6, updated_at = NOW()
            WHERE service_type = $1 AND service_id = $2 AND client_id = $3 AND account_id = $4
            RETURNING user_id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&spec.service_type)
            .bind(&spec.service_id)
            .bind(&spec.client_id)
            .bind(&spec.account_id)
            .bind(&data.auth_data)
            .bind(&data.account_data)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup external account")?;
        Ok(row.map(|row| row.get("user_id")))
    }

    async fn create_user_and_save(
        &self,
        user: &NewUser,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<User, CreateUserError> {
        if user.username.trim().is_empty() {
            return Err(CreateUserError::Presentation(
                "The username must not be empty.".to_string(),
            ));
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        let query = format!(
            "INSERT INTO users (username, email, email_verified, display_name, avatar_url) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(&user.username)
            .bind(user.email.as_deref().map(normalize_email))
            .bind(user.email_is_verified)
            .bind(&user.display_name)
            .bind(&user.avatar_url)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await;
        let created = match row {
            Ok(row) => user_from_row(&row),
            Err(err) => {
                return Err(match is_unique_violation(&err) {
                    Some(constraint) if constraint.contains("email") => {
                        CreateUserError::EmailExists
                    }
                    Some(_) => CreateUserError::UsernameExists,
                    None => CreateUserError::Other(
                        anyhow::Error::new(err).context("failed to insert user"),
                    ),
                });
            }
        };

        upsert_account(&mut tx, created.id, spec, data)
            .await
            .map_err(|err| CreateUserError::Other(anyhow::anyhow!(err)))?;
        tx.commit().await.context("failed to commit new user")?;
        Ok(created)
    }

    async fn associate_user_and_save(
        &self,
        user_id: i32,
        spec: &ExternalAccountSpec,
        data: &ExternalAccountData,
    ) -> Result<(), AssociateError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        upsert_account(&mut tx, user_id, spec, data).await?;
        tx.commit()
            .await
            .context("failed to commit external account")?;
        Ok(())
    }

    async fn update_profile_if_empty(
        &self,
        user_id: i32,
        display_name: &str,
        avatar_url: &str,
    ) -> Result<()> {
        let query = r"
            UPDATE users
            SET display_name = CASE WHEN display_name = '' THEN $2 ELSE display_name END,
                avatar_url = CASE WHEN avatar_url = '' THEN $3 ELSE avatar_url END
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(display_name)
            .bind(avatar_url)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update user profile")?;
        Ok(())
    }

    async fn invalidate_sessions(&self, ids: &[i32]) -> Result<()> {
        // The watermark only moves forward.
        let query = r"
            UPDATE users
            SET invalidated_sessions_at = GREATEST(COALESCE(invalidated_sessions_at, NOW()), NOW())
            WHERE id = ANY($1)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(ids)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to invalidate sessions")?;
        Ok(())
    }

    async fn check_password(&self, login: &str, password: &str) -> Result<Option<User>> {
        let query = format!(
            "SELECT {USER_COLUMNS}, password_hash FROM users \
             WHERE lower(username) = lower($1) OR email = $2 LIMIT 1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(login)
            .bind(normalize_email(login))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user credentials")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let hash: Option<String> = row.get("password_hash");
        let matches = hash.is_some_and(|hash| verify_password(&hash, password));
        Ok(matches.then(|| user_from_row(&row)))
    }
}
