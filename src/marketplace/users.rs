//! User lookup for order party snapshots.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::UserRole;

/// User row as the order core sees it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSummary {
    pub id: Uuid,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
}

/// Access to user accounts for the order core.
#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn fetch(&self, user_id: Uuid) -> Result<Option<UserSummary>, ApiError>;
}

/// User provider backed by the marketplace database.
#[derive(Clone)]
pub struct PgUserProvider {
    pool: PgPool,
}

impl PgUserProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserProvider for PgUserProvider {
    async fn fetch(&self, user_id: Uuid) -> Result<Option<UserSummary>, ApiError> {
        let user = sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT id, full_name, email, phone, role
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }
}
