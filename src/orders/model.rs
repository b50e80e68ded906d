//! Order entity, status machine vocabulary and request payloads.
//!
//! An order carries denormalized buyer/seller/listing snapshots taken at
//! creation time. They are never re-synced, so order history survives
//! profile and listing edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;
use validator::Validate;

use crate::marketplace::{ListingSummary, UserSummary};

/// Order lifecycle status.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "order_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    ReservedFull,
    ReservedDeposit,
    DepositExpired,
    PaymentTimeout,
    WaitingSellerConfirmation,
    Confirmed,
    Rejected,
    WaitingForPickup,
    InTransit,
    Delivered,
    WaitingRemainingPayment,
    Completed,
    FundsReleased,
    Cancelled,
    CancelledByBuyer,
    Disputed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::ReservedFull => "RESERVED_FULL",
            OrderStatus::ReservedDeposit => "RESERVED_DEPOSIT",
            OrderStatus::DepositExpired => "DEPOSIT_EXPIRED",
            OrderStatus::PaymentTimeout => "PAYMENT_TIMEOUT",
            OrderStatus::WaitingSellerConfirmation => "WAITING_SELLER_CONFIRMATION",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::WaitingForPickup => "WAITING_FOR_PICKUP",
            OrderStatus::InTransit => "IN_TRANSIT",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::WaitingRemainingPayment => "WAITING_REMAINING_PAYMENT",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::FundsReleased => "FUNDS_RELEASED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::CancelledByBuyer => "CANCELLED_BY_BUYER",
            OrderStatus::Disputed => "DISPUTED",
        }
    }

    /// Terminal states release the listing mutex: no further transitions,
    /// and a new order may be opened against the same listing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::FundsReleased
                | OrderStatus::Cancelled
                | OrderStatus::CancelledByBuyer
                | OrderStatus::DepositExpired
                | OrderStatus::Rejected
                | OrderStatus::PaymentTimeout
        )
    }

    /// Where an expired reservation lands, if this status can expire at all.
    pub fn timeout_state(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::ReservedFull => Some(OrderStatus::PaymentTimeout),
            OrderStatus::ReservedDeposit => Some(OrderStatus::DepositExpired),
            _ => None,
        }
    }
}

/// How the buyer funds the reservation. Fixed at creation.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_type")]
pub enum PaymentType {
    #[sqlx(rename = "DEPOSIT_10")]
    #[serde(rename = "DEPOSIT_10")]
    Deposit10,
    #[sqlx(rename = "FULL_100")]
    #[serde(rename = "FULL_100")]
    Full100,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Deposit10 => "DEPOSIT_10",
            PaymentType::Full100 => "FULL_100",
        }
    }
}

/// Buyer or seller as they looked when the order was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartySnapshot {
    pub id: Uuid,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl From<UserSummary> for PartySnapshot {
    fn from(user: UserSummary) -> Self {
        Self {
            id: user.id,
            full_name: user.full_name,
            email: user.email,
            phone: user.phone,
        }
    }
}

/// Listing as it looked when the order was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub id: Uuid,
    pub title: String,
    pub price: i64,
    pub primary_image: Option<String>,
    pub condition: Option<String>,
}

impl From<ListingSummary> for ListingSnapshot {
    fn from(listing: ListingSummary) -> Self {
        Self {
            id: listing.id,
            title: listing.title,
            price: listing.price,
            primary_image: listing.primary_image,
            condition: listing.condition,
        }
    }
}

/// Pricing applied at creation. Amounts are in minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderPricing {
    pub original_price: i64,
    pub discount_amount: i64,
    pub discount_percent: f64,
    pub discount_reason: Option<String>,
    pub final_price: i64,
}

/// Money bookkeeping for one order.
///
/// Stable-state invariant: `escrow_amount == deposit_paid + remaining_paid
/// - released_amount`. Escrow reaches zero only through refund, forfeiture
/// or release.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderAmounts {
    pub total: i64,
    pub deposit: i64,
    #[sqlx(flatten)]
    pub pricing: OrderPricing,
    pub deposit_paid: i64,
    pub remaining_paid: i64,
    pub escrow_amount: i64,
    pub released_amount: i64,
}

impl OrderAmounts {
    pub fn escrow_balanced(&self) -> bool {
        self.escrow_amount == self.deposit_paid + self.remaining_paid - self.released_amount
    }
}

/// Kind of money event recorded in the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    DepositPayment,
    FullPayment,
    RemainingPayment,
    Refund,
    Forfeiture,
    Release,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryStatus {
    Completed,
    Failed,
}

/// One append-only audit trail entry. Never edited after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub status: LedgerEntryStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        entry_type: LedgerEntryType,
        amount: i64,
        status: LedgerEntryStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_type,
            amount,
            status,
            note,
            created_at: at,
        }
    }
}

/// Buyer review attached once the order completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReview {
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The central order entity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub order_code: String,
    pub status: OrderStatus,
    pub payment_type: PaymentType,

    pub listing_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,

    pub buyer: Json<PartySnapshot>,
    pub seller: Json<PartySnapshot>,
    pub listing: Json<ListingSnapshot>,

    #[sqlx(flatten)]
    pub amounts: OrderAmounts,

    pub transactions: Json<Vec<LedgerEntry>>,
    pub review: Option<Json<OrderReview>>,

    pub reserved_at: DateTime<Utc>,
    pub reservation_expires_at: DateTime<Utc>,
    pub seller_confirmed_at: Option<DateTime<Utc>>,
    pub buyer_confirmed_at: Option<DateTime<Utc>>,
    pub funds_released_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// True when the order sits in a reserved status whose payment window
    /// has already closed.
    pub fn reservation_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            OrderStatus::ReservedFull | OrderStatus::ReservedDeposit
        ) && now > self.reservation_expires_at
    }

    /// Append an audit trail entry in memory. Persisted by the next write.
    pub fn push_entry(&mut self, entry: LedgerEntry) {
        self.transactions.0.push(entry);
    }

    /// Remaining balance a deposit-backed buyer still owes.
    pub fn remaining_due(&self) -> i64 {
        self.amounts.total - self.amounts.deposit
    }
}

/// Create order request
#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub listing_id: Uuid,
    pub payment_type: PaymentType,
    #[validate(range(min = 0.0, max = 100.0))]
    pub discount_percent: Option<f64>,
    #[validate(length(max = 200))]
    pub discount_reason: Option<String>,
}

/// Cancel order request
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelOrderRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: Option<String>,
}

/// Reject order request
#[derive(Debug, Default, Deserialize, Validate)]
pub struct RejectOrderRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: Option<String>,
}

/// Dispute order request
#[derive(Debug, Deserialize, Validate)]
pub struct DisputeOrderRequest {
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

/// Review order request
#[derive(Debug, Deserialize, Validate)]
pub struct ReviewOrderRequest {
    #[validate(range(min = 1, max = 5))]
    pub rating: i32,
    #[validate(length(max = 1000))]
    pub comment: Option<String>,
}

/// Which side of their orders a user is asking for.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buyer,
    Seller,
}

/// Query parameters for GET /orders/me
#[derive(Debug, Deserialize)]
pub struct MyOrdersQuery {
    pub side: Option<OrderSide>,
    pub status: Option<OrderStatus>,
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

/// Query parameters for the admin order listing
#[derive(Debug, Deserialize)]
pub struct AdminOrdersQuery {
    pub status: Option<OrderStatus>,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub page: Option<i32>,
    pub limit: Option<i32>,
}
