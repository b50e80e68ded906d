//! Notification delivery.
//!
//! Notifications are best-effort: the order core logs failures and moves on
//! rather than failing a settlement action over a missed message.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;

/// Sink for user-facing order notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        event: &str,
        title: &str,
        content: &str,
        payload: serde_json::Value,
    ) -> Result<(), ApiError>;
}

/// Notification sink writing to the notifications table.
#[derive(Clone)]
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn notify(
        &self,
        user_id: Uuid,
        event: &str,
        title: &str,
        content: &str,
        payload: serde_json::Value,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, event, title, content, payload, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(event)
        .bind(title)
        .bind(content)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
