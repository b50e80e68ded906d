//! Persistence and query surface for orders.
//!
//! Every state transition funnels through `transition_status`, an optimistic
//! compare-and-set keyed on the caller's expected status. Concurrent writers
//! racing on one order therefore resolve to one winner and one conflict.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::error::ApiError;
use crate::orders::model::{LedgerEntry, Order, OrderReview, OrderStatus};

/// Filters for the admin order listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
}

/// Order entity store.
#[derive(Clone)]
pub struct OrderLedger {
    pool: PgPool,
}

impl OrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a freshly created order.
    ///
    /// The partial unique index on active orders turns a create race for one
    /// listing into exactly one success and one conflict.
    pub async fn insert(&self, order: &Order) -> Result<Order, ApiError> {
        let result = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (
                id, order_code, status, payment_type,
                listing_id, buyer_id, seller_id,
                buyer, seller, listing,
                total, deposit, original_price, discount_amount, discount_percent,
                discount_reason, final_price,
                deposit_paid, remaining_paid, escrow_amount, released_amount,
                transactions, review,
                reserved_at, reservation_expires_at, seller_confirmed_at,
                buyer_confirmed_at, funds_released_at, cancelled_at, cancel_reason,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
                $31, $32
            )
            RETURNING *
            "#,
        )
        .bind(order.id)
        .bind(&order.order_code)
        .bind(order.status)
        .bind(order.payment_type)
        .bind(order.listing_id)
        .bind(order.buyer_id)
        .bind(order.seller_id)
        .bind(&order.buyer)
        .bind(&order.seller)
        .bind(&order.listing)
        .bind(order.amounts.total)
        .bind(order.amounts.deposit)
        .bind(order.amounts.pricing.original_price)
        .bind(order.amounts.pricing.discount_amount)
        .bind(order.amounts.pricing.discount_percent)
        .bind(&order.amounts.pricing.discount_reason)
        .bind(order.amounts.pricing.final_price)
        .bind(order.amounts.deposit_paid)
        .bind(order.amounts.remaining_paid)
        .bind(order.amounts.escrow_amount)
        .bind(order.amounts.released_amount)
        .bind(&order.transactions)
        .bind(&order.review)
        .bind(order.reserved_at)
        .bind(order.reservation_expires_at)
        .bind(order.seller_confirmed_at)
        .bind(order.buyer_confirmed_at)
        .bind(order.funds_released_at)
        .bind(order.cancelled_at)
        .bind(&order.cancel_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(order) => Ok(order),
            Err(sqlx::Error::Database(db))
                if db.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                match db.constraint() {
                    Some("orders_one_active_per_listing") => Err(ApiError::Conflict(
                        "An active order already exists for this listing".to_string(),
                    )),
                    Some("orders_order_code_key") => Err(ApiError::Conflict(
                        "Order code collision, please retry".to_string(),
                    )),
                    _ => Err(ApiError::Conflict("Duplicate order".to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get an order by ID.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, ApiError> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// List orders with filtering and pagination. Returns the page and the
    /// total match count.
    pub async fn list(
        &self,
        filter: OrderFilter,
        page: Option<i32>,
        limit: Option<i32>,
    ) -> Result<(Vec<Order>, i64), ApiError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * limit;

        let mut count_builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM orders WHERE 1=1");
        Self::push_filter(&mut count_builder, &filter);

        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut query_builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM orders WHERE 1=1");
        Self::push_filter(&mut query_builder, &filter);

        query_builder.push(" ORDER BY created_at DESC LIMIT ");
        query_builder.push_bind(limit as i64);
        query_builder.push(" OFFSET ");
        query_builder.push_bind(offset as i64);

        let orders = query_builder
            .build_query_as::<Order>()
            .fetch_all(&self.pool)
            .await?;

        Ok((orders, total))
    }

    fn push_filter(builder: &mut QueryBuilder<sqlx::Postgres>, filter: &OrderFilter) {
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        if let Some(buyer_id) = filter.buyer_id {
            builder.push(" AND buyer_id = ");
            builder.push_bind(buyer_id);
        }
        if let Some(seller_id) = filter.seller_id {
            builder.push(" AND seller_id = ");
            builder.push_bind(seller_id);
        }
    }

    /// Apply a state transition guarded by the expected current status.
    ///
    /// Loads the order, verifies it still sits in `expected`, applies the
    /// mutation in memory, then writes back with `WHERE status = expected`.
    /// A concurrent transition makes the write miss and surfaces as a
    /// conflict instead of a double-applied transition.
    pub async fn transition_status<F>(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        mutate: F,
    ) -> Result<Order, ApiError>
    where
        F: FnOnce(&mut Order) -> Result<(), ApiError>,
    {
        let mut order = self
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Order {} not found", order_id)))?;

        if order.status != expected {
            return Err(ApiError::Conflict(format!(
                "Order is {}, expected {}",
                order.status.as_str(),
                expected.as_str()
            )));
        }

        mutate(&mut order)?;

        if !order.amounts.escrow_balanced() {
            tracing::warn!(
                order_id = %order.id,
                escrow = order.amounts.escrow_amount,
                "Escrow bookkeeping out of balance after transition"
            );
        }

        let updated = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders SET
                status = $3,
                deposit_paid = $4,
                remaining_paid = $5,
                escrow_amount = $6,
                released_amount = $7,
                transactions = $8,
                review = $9,
                seller_confirmed_at = $10,
                buyer_confirmed_at = $11,
                funds_released_at = $12,
                cancelled_at = $13,
                cancel_reason = $14,
                updated_at = $15
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(expected)
        .bind(order.status)
        .bind(order.amounts.deposit_paid)
        .bind(order.amounts.remaining_paid)
        .bind(order.amounts.escrow_amount)
        .bind(order.amounts.released_amount)
        .bind(&order.transactions)
        .bind(&order.review)
        .bind(order.seller_confirmed_at)
        .bind(order.buyer_confirmed_at)
        .bind(order.funds_released_at)
        .bind(order.cancelled_at)
        .bind(&order.cancel_reason)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            ApiError::Conflict("Order was modified concurrently, please retry".to_string())
        })
    }

    /// Append one audit trail entry without touching the rest of the order.
    /// Prior entries are never edited or removed.
    pub async fn append_transaction(
        &self,
        order_id: Uuid,
        entry: &LedgerEntry,
    ) -> Result<(), ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET transactions = transactions || $2::jsonb, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(Json(entry))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound(format!("Order {} not found", order_id)));
        }

        Ok(())
    }

    /// Reserved orders whose payment window has closed.
    pub async fn find_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, ApiError> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE status IN ('RESERVED_FULL', 'RESERVED_DEPOSIT')
              AND reservation_expires_at < $1
            ORDER BY reservation_expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Completed orders whose cooling-off window has passed and whose escrow
    /// still holds funds. Already-released orders fall out of the predicate,
    /// which is what makes the release sweep idempotent.
    pub async fn find_release_due(
        &self,
        confirmed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, ApiError> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE status = 'COMPLETED'
              AND buyer_confirmed_at IS NOT NULL
              AND buyer_confirmed_at <= $1
              AND escrow_amount > 0
            ORDER BY buyer_confirmed_at ASC
            LIMIT $2
            "#,
        )
        .bind(confirmed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Attach the buyer's review. Guarded in SQL so an order is reviewed at
    /// most once even under concurrent requests.
    pub async fn attach_review(
        &self,
        order_id: Uuid,
        review: &Json<OrderReview>,
    ) -> Result<Order, ApiError> {
        let updated = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET review = $2, updated_at = $3
            WHERE id = $1
              AND review IS NULL
              AND status IN ('COMPLETED', 'FUNDS_RELEASED')
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(review)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            ApiError::Conflict("Order cannot be reviewed, or was already reviewed".to_string())
        })
    }
}
