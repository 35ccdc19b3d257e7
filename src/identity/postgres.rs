use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Credentials, Identity, IdentityStore, NewIdentity};
use crate::error::{AppError, DatabaseError};

/// Identity store backed by the `users` table
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, AppError> {
        let row = sqlx::query_as::<_, (Uuid, String, String, bool)>(
            "SELECT id, username, role, is_active FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, username, role, is_active)| Identity {
            id,
            username,
            role,
            is_active,
        }))
    }

    async fn find_credentials(&self, username: &str) -> Result<Option<Credentials>, AppError> {
        let row = sqlx::query_as::<_, (Uuid, String, String, bool, String)>(
            r#"
            SELECT id, username, role, is_active, password_hash
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, username, role, is_active, password_hash)| Credentials {
            identity: Identity {
                id,
                username,
                role,
                is_active,
            },
            password_hash,
        }))
    }

    async fn create(&self, new: NewIdentity) -> Result<Identity, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO users (id, username, password_hash, role, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, true, $5, $5)
            "#,
        )
        .bind(id)
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(&new.role)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Identity {
            id,
            username: new.username,
            role: new.role,
            is_active: true,
        })
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(password_hash)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Database(DatabaseError::NotFound(
                "User account".to_string(),
            )));
        }
        Ok(())
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET last_login_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
