use std::{future::Future, time::Duration};

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::auth::repo_types::User;
use crate::error::StoreError;

/// Persistent identity state. Uniqueness of `email` and `google_id` is enforced
/// here and nowhere else.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user, stamping `created_at`/`updated_at`.
    async fn create(&self, user: User) -> Result<User, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<User, StoreError>;
    async fn find_by_federated_id(&self, google_id: &str) -> Result<User, StoreError>;
    /// Full-record replace keyed by `id`; refreshes `updated_at`.
    async fn update(&self, user: User) -> Result<User, StoreError>;
    /// Flip the pending user owning `code` to verified and clear the code in a
    /// single statement.
    async fn mark_verified(&self, code: &str) -> Result<User, StoreError>;
}

const USER_COLUMNS: &str = "id, full_name, email, password_hash, verified, verification_code, \
                            google_id, avatar, provider, created_at, updated_at";

pub struct PgUserStore {
    db: PgPool,
    timeout: Duration,
}

impl PgUserStore {
    pub fn new(db: PgPool, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(map_db_error),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<User, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        self.bounded(
            sqlx::query_as::<_, User>(&sql)
                .bind(value)
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(StoreError::NotFound)
    }
}

fn map_db_error(e: sqlx::Error) -> StoreError {
    if let Some(db_err) = e.as_database_error() {
        match db_err.constraint() {
            Some("users_email_key") => return StoreError::DuplicateEmail,
            Some("users_google_id_key") => return StoreError::DuplicateFederatedId,
            _ => {}
        }
    }
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, mut user: User) -> Result<User, StoreError> {
        let now = OffsetDateTime::now_utc();
        user.created_at = now;
        user.updated_at = now;

        let sql = format!(
            r#"
            INSERT INTO users (id, full_name, email, password_hash, verified, verification_code,
                               google_id, avatar, provider, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {USER_COLUMNS}
            "#
        );
        let created = self
            .bounded(
                sqlx::query_as::<_, User>(&sql)
                    .bind(user.id)
                    .bind(&user.full_name)
                    .bind(&user.email)
                    .bind(&user.password_hash)
                    .bind(user.verified)
                    .bind(&user.verification_code)
                    .bind(&user.google_id)
                    .bind(&user.avatar)
                    .bind(user.provider.map(|p| p.as_str()))
                    .bind(user.created_at)
                    .bind(user.updated_at)
                    .fetch_one(&self.db),
            )
            .await?;
        debug!(user_id = %created.id, "user row inserted");
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        self.bounded(
            sqlx::query_as::<_, User>(&sql)
                .bind(id)
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.find_one("email", email).await
    }

    async fn find_by_federated_id(&self, google_id: &str) -> Result<User, StoreError> {
        self.find_one("google_id", google_id).await
    }

    async fn update(&self, user: User) -> Result<User, StoreError> {
        let sql = format!(
            r#"
            UPDATE users
               SET full_name = $2, email = $3, password_hash = $4, verified = $5,
                   verification_code = $6, google_id = $7, avatar = $8, provider = $9,
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        self.bounded(
            sqlx::query_as::<_, User>(&sql)
                .bind(user.id)
                .bind(&user.full_name)
                .bind(&user.email)
                .bind(&user.password_hash)
                .bind(user.verified)
                .bind(&user.verification_code)
                .bind(&user.google_id)
                .bind(&user.avatar)
                .bind(user.provider.map(|p| p.as_str()))
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn mark_verified(&self, code: &str) -> Result<User, StoreError> {
        let sql = format!(
            r#"
            UPDATE users
               SET verified = TRUE, verification_code = NULL, updated_at = now()
             WHERE verification_code = $1 AND verified = FALSE
            RETURNING {USER_COLUMNS}
            "#
        );
        self.bounded(
            sqlx::query_as::<_, User>(&sql)
                .bind(code)
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(StoreError::InvalidCode)
    }
}
