//! Listing lookup and status transitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;

/// Listing lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "listing_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Pending,
    Available,
    Reserved,
    Sold,
    Hidden,
    Rejected,
}

/// Listing row as the order core sees it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ListingSummary {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub price: i64,
    pub primary_image: Option<String>,
    pub condition: Option<String>,
    pub status: ListingStatus,
}

/// Access to listings for the order core.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    /// Load a listing by id.
    async fn fetch(&self, listing_id: Uuid) -> Result<Option<ListingSummary>, ApiError>;

    /// Move a listing from `expected` to `next`. Returns false when the
    /// listing was not in `expected`, so callers can tell a lost race from
    /// a successful flip.
    async fn try_set_status(
        &self,
        listing_id: Uuid,
        expected: ListingStatus,
        next: ListingStatus,
    ) -> Result<bool, ApiError>;
}

/// Listing provider backed by the marketplace database.
#[derive(Clone)]
pub struct PgListingProvider {
    pool: PgPool,
}

impl PgListingProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListingProvider for PgListingProvider {
    async fn fetch(&self, listing_id: Uuid) -> Result<Option<ListingSummary>, ApiError> {
        let listing = sqlx::query_as::<_, ListingSummary>(
            r#"
            SELECT id, seller_id, title, price, primary_image, condition, status
            FROM listings
            WHERE id = $1
            "#,
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(listing)
    }

    async fn try_set_status(
        &self,
        listing_id: Uuid,
        expected: ListingStatus,
        next: ListingStatus,
    ) -> Result<bool, ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(listing_id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
