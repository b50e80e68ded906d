//! Order state machine.
//!
//! Every mutation goes through the ledger's compare-and-set primitive.
//! Listing flips, fund movements and notifications run after the order
//! mutation commits; they are logged and retried on failure but never roll
//! back an already-committed transition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::marketplace::{
    FundsGateway, ListingProvider, ListingStatus, LoggingFundsGateway, NotificationSink,
    PgListingProvider, PgNotificationSink, PgUserProvider, UserProvider,
};
use crate::models::UserRole;
use crate::orders::ledger::{OrderFilter, OrderLedger};
use crate::orders::model::{
    AdminOrdersQuery, CancelOrderRequest, CreateOrderRequest, DisputeOrderRequest, LedgerEntry,
    LedgerEntryStatus, LedgerEntryType, ListingSnapshot, MyOrdersQuery, Order, OrderAmounts,
    OrderPricing, OrderReview, OrderSide, OrderStatus, PartySnapshot, PaymentType,
    RejectOrderRequest, ReviewOrderRequest,
};
use crate::policy::{self, Clock, SystemClock};

const ORDER_CODE_PREFIX: &str = "ORD";

/// Order settlement service.
pub struct OrderService {
    ledger: OrderLedger,
    listings: Arc<dyn ListingProvider>,
    users: Arc<dyn UserProvider>,
    notifier: Arc<dyn NotificationSink>,
    funds: Arc<dyn FundsGateway>,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(
        ledger: OrderLedger,
        listings: Arc<dyn ListingProvider>,
        users: Arc<dyn UserProvider>,
        notifier: Arc<dyn NotificationSink>,
        funds: Arc<dyn FundsGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            listings,
            users,
            notifier,
            funds,
            clock,
        }
    }

    /// Service wired to the shared database with production collaborators.
    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(
            OrderLedger::new(pool.clone()),
            Arc::new(PgListingProvider::new(pool.clone())),
            Arc::new(PgUserProvider::new(pool.clone())),
            Arc::new(PgNotificationSink::new(pool)),
            Arc::new(LoggingFundsGateway),
            Arc::new(SystemClock),
        )
    }

    /// Reserve a listing for a buyer.
    ///
    /// Snapshots buyer, seller and listing, computes pricing and opens the
    /// reservation window. The ledger's unique active-order guard decides
    /// races between concurrent buyers.
    pub async fn create_order(
        &self,
        buyer_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<Order, ApiError> {
        let buyer = self
            .users
            .fetch(buyer_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Buyer account not found".to_string()))?;

        let listing = self
            .listings
            .fetch(request.listing_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Listing not found".to_string()))?;

        if listing.seller_id == buyer_id {
            return Err(ApiError::Validation(
                "You cannot order your own listing".to_string(),
            ));
        }

        if listing.status != ListingStatus::Available {
            return Err(ApiError::Conflict("Listing is not available".to_string()));
        }

        let seller = self.users.fetch(listing.seller_id).await?.ok_or_else(|| {
            ApiError::Dependency("Seller account could not be loaded".to_string())
        })?;

        let now = self.clock.now();
        let discount_percent = request.discount_percent.unwrap_or(0.0).clamp(0.0, 100.0);
        let discount_amount = policy::compute_discount(listing.price, discount_percent);
        let final_price = listing.price - discount_amount;
        let deposit = policy::compute_deposit(final_price, policy::DEPOSIT_PERCENT);

        let status = match request.payment_type {
            PaymentType::Full100 => OrderStatus::ReservedFull,
            PaymentType::Deposit10 => OrderStatus::ReservedDeposit,
        };

        let draft = Order {
            id: Uuid::new_v4(),
            order_code: policy::generate_order_code(ORDER_CODE_PREFIX, now),
            status,
            payment_type: request.payment_type,
            listing_id: listing.id,
            buyer_id,
            seller_id: listing.seller_id,
            buyer: Json(PartySnapshot::from(buyer)),
            seller: Json(PartySnapshot::from(seller)),
            amounts: OrderAmounts {
                total: final_price,
                deposit,
                pricing: OrderPricing {
                    original_price: listing.price,
                    discount_amount,
                    discount_percent,
                    discount_reason: request.discount_reason,
                    final_price,
                },
                deposit_paid: 0,
                remaining_paid: 0,
                escrow_amount: 0,
                released_amount: 0,
            },
            listing: Json(ListingSnapshot::from(listing)),
            transactions: Json(vec![]),
            review: None,
            reserved_at: now,
            reservation_expires_at: now + policy::reservation_window(request.payment_type),
            seller_confirmed_at: None,
            buyer_confirmed_at: None,
            funds_released_at: None,
            cancelled_at: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };

        let order = self.ledger.insert(&draft).await?;

        tracing::info!(
            order_code = %order.order_code,
            listing_id = %order.listing_id,
            payment_type = order.payment_type.as_str(),
            "Order created"
        );

        self.flip_listing(
            order.listing_id,
            ListingStatus::Available,
            ListingStatus::Reserved,
        )
        .await;

        self.notify_quietly(
            order.seller_id,
            "order.created",
            "New reservation on your listing",
            &format!(
                "Listing \"{}\" was reserved under order {}",
                order.listing.title, order.order_code
            ),
            serde_json::json!({ "order_id": order.id, "order_code": order.order_code }),
        )
        .await;

        Ok(order)
    }

    /// Collect the buyer's payment into escrow.
    ///
    /// Expiry is enforced before the payment is evaluated: a payment
    /// arriving after the deadline moves the order to its timeout state and
    /// is rejected, never silently accepted.
    pub async fn pay_order(&self, caller_id: Uuid, order_id: Uuid) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.buyer_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the buyer can pay for this order".to_string(),
            ));
        }

        let now = self.clock.now();

        match order.status {
            OrderStatus::ReservedFull | OrderStatus::ReservedDeposit => {
                if order.reservation_expired(now) {
                    return self.reject_late_payment(order, now).await;
                }
                self.collect_reservation_payment(order, now).await
            }
            OrderStatus::WaitingRemainingPayment => {
                self.collect_remaining_payment(order, now).await
            }
            other => Err(ApiError::Conflict(format!(
                "Order cannot be paid while {}",
                other.as_str()
            ))),
        }
    }

    /// Seller accepts the paid order.
    pub async fn confirm_order(&self, caller_id: Uuid, order_id: Uuid) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.seller_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the seller can confirm this order".to_string(),
            ));
        }

        let now = self.clock.now();
        let confirmed = self
            .ledger
            .transition_status(
                order.id,
                OrderStatus::WaitingSellerConfirmation,
                |order| {
                    order.seller_confirmed_at = Some(now);
                    order.status = OrderStatus::Confirmed;
                    Ok(())
                },
            )
            .await?;

        tracing::info!(order_code = %confirmed.order_code, "Seller confirmed order");

        self.notify_quietly(
            confirmed.buyer_id,
            "order.confirmed",
            "Order confirmed",
            &format!("The seller confirmed order {}", confirmed.order_code),
            serde_json::json!({ "order_id": confirmed.id, "status": confirmed.status }),
        )
        .await;

        Ok(confirmed)
    }

    /// Seller turns the order down. Escrow is refunded in full and the
    /// listing goes back on the market.
    pub async fn reject_order(
        &self,
        caller_id: Uuid,
        order_id: Uuid,
        request: RejectOrderRequest,
    ) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.seller_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the seller can reject this order".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut refunded: i64 = 0;

        let rejected = self
            .ledger
            .transition_status(
                order.id,
                OrderStatus::WaitingSellerConfirmation,
                |order| {
                    refunded = order.amounts.escrow_amount;
                    if refunded > 0 {
                        order.push_entry(LedgerEntry::new(
                            LedgerEntryType::Refund,
                            refunded,
                            LedgerEntryStatus::Completed,
                            Some("Rejected by seller".to_string()),
                            now,
                        ));
                    }
                    order.amounts.deposit_paid = 0;
                    order.amounts.remaining_paid = 0;
                    order.amounts.escrow_amount = 0;
                    order.cancelled_at = Some(now);
                    order.cancel_reason = Some(
                        request
                            .reason
                            .unwrap_or_else(|| "Rejected by seller".to_string()),
                    );
                    order.status = OrderStatus::Rejected;
                    Ok(())
                },
            )
            .await?;

        tracing::info!(
            order_code = %rejected.order_code,
            refunded = refunded,
            "Order rejected by seller"
        );

        self.flip_listing(
            rejected.listing_id,
            ListingStatus::Reserved,
            ListingStatus::Available,
        )
        .await;

        if refunded > 0 {
            self.send_refund(&rejected, refunded).await;
        }

        self.notify_quietly(
            rejected.buyer_id,
            "order.rejected",
            "Order rejected",
            &format!(
                "The seller rejected order {}; your payment is being refunded",
                rejected.order_code
            ),
            serde_json::json!({ "order_id": rejected.id, "refunded": refunded }),
        )
        .await;

        Ok(rejected)
    }

    /// Buyer cancels. Before seller confirmation this refunds in full;
    /// after confirmation the escrow is forfeited to the seller.
    pub async fn cancel_order(
        &self,
        caller_id: Uuid,
        order_id: Uuid,
        request: CancelOrderRequest,
    ) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.buyer_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the buyer can cancel this order".to_string(),
            ));
        }

        let now = self.clock.now();

        match order.status {
            OrderStatus::ReservedFull
            | OrderStatus::ReservedDeposit
            | OrderStatus::WaitingSellerConfirmation => {
                self.cancel_with_refund(order, request.reason, now).await
            }
            OrderStatus::Confirmed | OrderStatus::WaitingForPickup | OrderStatus::InTransit => {
                self.cancel_with_forfeiture(order, request.reason, now)
                    .await
            }
            other => Err(ApiError::Conflict(format!(
                "Order can no longer be cancelled while {}",
                other.as_str()
            ))),
        }
    }

    /// Buyer confirms receipt of the delivered item.
    ///
    /// Deposit-backed orders with an outstanding balance move to
    /// WAITING_REMAINING_PAYMENT; fully paid orders complete and start the
    /// cooling-off period.
    pub async fn receive_order(&self, caller_id: Uuid, order_id: Uuid) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.buyer_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the buyer can confirm receipt".to_string(),
            ));
        }

        let now = self.clock.now();
        let received = self
            .ledger
            .transition_status(order.id, OrderStatus::Delivered, |order| {
                if order.payment_type == PaymentType::Deposit10
                    && order.amounts.remaining_paid == 0
                {
                    order.status = OrderStatus::WaitingRemainingPayment;
                } else {
                    order.buyer_confirmed_at = Some(now);
                    order.status = OrderStatus::Completed;
                }
                Ok(())
            })
            .await?;

        if received.status == OrderStatus::WaitingRemainingPayment {
            self.notify_quietly(
                received.buyer_id,
                "order.balance_due",
                "Remaining balance due",
                &format!(
                    "Pay the remaining balance of {} to complete order {}",
                    received.remaining_due(),
                    received.order_code
                ),
                serde_json::json!({ "order_id": received.id, "amount_due": received.remaining_due() }),
            )
            .await;
        } else {
            tracing::info!(order_code = %received.order_code, "Buyer confirmed receipt");

            self.flip_listing(
                received.listing_id,
                ListingStatus::Reserved,
                ListingStatus::Sold,
            )
            .await;

            self.notify_quietly(
                received.seller_id,
                "order.completed",
                "Order completed",
                &format!(
                    "The buyer confirmed receipt of order {}; funds release after the cooling-off period",
                    received.order_code
                ),
                serde_json::json!({ "order_id": received.id, "status": received.status }),
            )
            .await;
        }

        Ok(received)
    }

    /// Admin moves a confirmed order one step along the fulfillment chain:
    /// CONFIRMED, WAITING_FOR_PICKUP, IN_TRANSIT, then DELIVERED.
    pub async fn advance_fulfillment(&self, order_id: Uuid) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        let next = match order.status {
            OrderStatus::Confirmed => OrderStatus::WaitingForPickup,
            OrderStatus::WaitingForPickup => OrderStatus::InTransit,
            OrderStatus::InTransit => OrderStatus::Delivered,
            other => {
                return Err(ApiError::Conflict(format!(
                    "No fulfillment step from {}",
                    other.as_str()
                )))
            }
        };

        let advanced = self
            .ledger
            .transition_status(order.id, order.status, |order| {
                order.status = next;
                Ok(())
            })
            .await?;

        tracing::info!(
            order_code = %advanced.order_code,
            status = advanced.status.as_str(),
            "Fulfillment advanced"
        );

        if advanced.status == OrderStatus::Delivered {
            self.notify_quietly(
                advanced.buyer_id,
                "order.delivered",
                "Order delivered",
                &format!(
                    "Order {} was delivered; confirm receipt to continue",
                    advanced.order_code
                ),
                serde_json::json!({ "order_id": advanced.id }),
            )
            .await;
        }

        Ok(advanced)
    }

    /// Buyer opens a dispute while escrow is still held. A disputed order
    /// is excluded from the release sweep until resolved out of band.
    pub async fn dispute_order(
        &self,
        caller_id: Uuid,
        order_id: Uuid,
        request: DisputeOrderRequest,
    ) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.buyer_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the buyer can dispute this order".to_string(),
            ));
        }

        if !matches!(
            order.status,
            OrderStatus::Delivered | OrderStatus::Completed
        ) {
            return Err(ApiError::Conflict(format!(
                "Order cannot be disputed while {}",
                order.status.as_str()
            )));
        }

        if order.amounts.escrow_amount <= 0 {
            return Err(ApiError::Conflict(
                "No escrowed funds left to dispute".to_string(),
            ));
        }

        let disputed = self
            .ledger
            .transition_status(order.id, order.status, |order| {
                order.status = OrderStatus::Disputed;
                Ok(())
            })
            .await?;

        tracing::warn!(
            order_code = %disputed.order_code,
            reason = %request.reason,
            "Order disputed by buyer"
        );

        self.notify_quietly(
            disputed.seller_id,
            "order.disputed",
            "Order disputed",
            &format!(
                "The buyer disputed order {}: {}",
                disputed.order_code, request.reason
            ),
            serde_json::json!({ "order_id": disputed.id, "reason": request.reason }),
        )
        .await;

        Ok(disputed)
    }

    /// Buyer leaves a one-time review on a completed order.
    pub async fn review_order(
        &self,
        caller_id: Uuid,
        order_id: Uuid,
        request: ReviewOrderRequest,
    ) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        if order.buyer_id != caller_id {
            return Err(ApiError::Forbidden(
                "Only the buyer can review this order".to_string(),
            ));
        }

        if !matches!(
            order.status,
            OrderStatus::Completed | OrderStatus::FundsReleased
        ) {
            return Err(ApiError::Conflict(format!(
                "Order cannot be reviewed while {}",
                order.status.as_str()
            )));
        }

        if order.review.is_some() {
            return Err(ApiError::Conflict(
                "Order was already reviewed".to_string(),
            ));
        }

        let review = Json(OrderReview {
            rating: request.rating,
            comment: request.comment,
            created_at: self.clock.now(),
        });

        let reviewed = self.ledger.attach_review(order.id, &review).await?;

        self.notify_quietly(
            reviewed.seller_id,
            "order.reviewed",
            "New review received",
            &format!("The buyer reviewed order {}", reviewed.order_code),
            serde_json::json!({ "order_id": reviewed.id, "rating": request.rating }),
        )
        .await;

        Ok(reviewed)
    }

    /// Load one order, visible to its buyer, its seller and admins.
    pub async fn get_order(
        &self,
        caller_id: Uuid,
        caller_role: UserRole,
        order_id: Uuid,
    ) -> Result<Order, ApiError> {
        let order = self.load(order_id).await?;

        let allowed = caller_role == UserRole::Admin
            || order.buyer_id == caller_id
            || order.seller_id == caller_id;
        if !allowed {
            return Err(ApiError::Forbidden(
                "You are not a party to this order".to_string(),
            ));
        }

        Ok(order)
    }

    /// Orders where the caller is buyer or seller.
    pub async fn list_my_orders(
        &self,
        caller_id: Uuid,
        query: MyOrdersQuery,
    ) -> Result<(Vec<Order>, i64), ApiError> {
        let mut filter = OrderFilter {
            status: query.status,
            ..Default::default()
        };
        match query.side.unwrap_or(OrderSide::Buyer) {
            OrderSide::Buyer => filter.buyer_id = Some(caller_id),
            OrderSide::Seller => filter.seller_id = Some(caller_id),
        }

        self.ledger.list(filter, query.page, query.limit).await
    }

    /// Admin-wide order listing.
    pub async fn list_orders(
        &self,
        query: AdminOrdersQuery,
    ) -> Result<(Vec<Order>, i64), ApiError> {
        let filter = OrderFilter {
            status: query.status,
            buyer_id: query.buyer_id,
            seller_id: query.seller_id,
        };

        self.ledger.list(filter, query.page, query.limit).await
    }

    // ===== Sweep entry points =====

    /// Reserved orders the expiry sweep should process.
    pub async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Order>, ApiError> {
        self.ledger
            .find_expired_reservations(now, policy::SWEEP_BATCH_SIZE)
            .await
    }

    /// Completed orders the release sweep should process.
    pub async fn release_due(&self, now: DateTime<Utc>) -> Result<Vec<Order>, ApiError> {
        self.ledger
            .find_release_due(now - policy::release_delay(), policy::SWEEP_BATCH_SIZE)
            .await
    }

    /// Move an expired reservation to its timeout state and put the listing
    /// back on the market. Safe to call concurrently with a buyer's payment
    /// attempt: exactly one of the two transitions wins.
    pub async fn expire_reservation(&self, order: &Order) -> Result<Order, ApiError> {
        let target = order.status.timeout_state().ok_or_else(|| {
            ApiError::Conflict(format!(
                "Order in {} has no reservation to expire",
                order.status.as_str()
            ))
        })?;

        let expired = self
            .ledger
            .transition_status(order.id, order.status, |order| {
                order.status = target;
                Ok(())
            })
            .await?;

        tracing::info!(
            order_code = %expired.order_code,
            status = expired.status.as_str(),
            "Reservation expired"
        );

        self.flip_listing(
            expired.listing_id,
            ListingStatus::Reserved,
            ListingStatus::Available,
        )
        .await;

        self.notify_quietly(
            expired.buyer_id,
            "order.expired",
            "Reservation expired",
            &format!("Order {} expired before payment", expired.order_code),
            serde_json::json!({ "order_id": expired.id, "status": expired.status }),
        )
        .await;

        Ok(expired)
    }

    /// Release escrow to the seller once the cooling-off period has passed.
    pub async fn release_funds(&self, order: &Order) -> Result<Order, ApiError> {
        let now = self.clock.now();
        let mut released: i64 = 0;

        let done = self
            .ledger
            .transition_status(order.id, OrderStatus::Completed, |order| {
                let confirmed_at = order.buyer_confirmed_at.ok_or_else(|| {
                    ApiError::Conflict(
                        "Order has no buyer confirmation timestamp".to_string(),
                    )
                })?;
                if now < confirmed_at + policy::release_delay() {
                    return Err(ApiError::Conflict(
                        "Cooling-off period still running".to_string(),
                    ));
                }

                released = order.amounts.escrow_amount;
                if released <= 0 {
                    return Err(ApiError::Conflict(
                        "No escrowed funds to release".to_string(),
                    ));
                }

                order.push_entry(LedgerEntry::new(
                    LedgerEntryType::Release,
                    released,
                    LedgerEntryStatus::Completed,
                    None,
                    now,
                ));
                order.amounts.released_amount = order.amounts.pricing.final_price;
                order.amounts.escrow_amount = 0;
                order.funds_released_at = Some(now);
                order.status = OrderStatus::FundsReleased;
                Ok(())
            })
            .await?;

        tracing::info!(
            order_code = %done.order_code,
            released = released,
            "Escrow released to seller"
        );

        self.send_credit(&done, released).await;

        self.notify_quietly(
            done.seller_id,
            "order.funds_released",
            "Funds released",
            &format!("Escrow for order {} was released to you", done.order_code),
            serde_json::json!({ "order_id": done.id, "amount": released }),
        )
        .await;

        Ok(done)
    }

    // ===== Private helpers =====

    async fn load(&self, order_id: Uuid) -> Result<Order, ApiError> {
        self.ledger
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Payment arrived after the deadline: flip to the timeout state, record
    /// the failed attempt in the audit trail, then reject with Expired.
    async fn reject_late_payment(
        &self,
        order: Order,
        now: DateTime<Utc>,
    ) -> Result<Order, ApiError> {
        let expired = self.expire_reservation(&order).await?;

        let attempted = match order.payment_type {
            PaymentType::Full100 => order.amounts.total,
            PaymentType::Deposit10 => order.amounts.deposit,
        };
        let entry = LedgerEntry::new(
            payment_entry_type(order.payment_type),
            attempted,
            LedgerEntryStatus::Failed,
            Some("Payment attempted after reservation expiry".to_string()),
            now,
        );
        if let Err(e) = self.ledger.append_transaction(expired.id, &entry).await {
            tracing::warn!(
                order_id = %expired.id,
                error = %e,
                "Failed to record late payment attempt"
            );
        }

        Err(ApiError::Expired(
            "Reservation expired before payment was received".to_string(),
        ))
    }

    async fn collect_reservation_payment(
        &self,
        order: Order,
        now: DateTime<Utc>,
    ) -> Result<Order, ApiError> {
        let paid = self
            .ledger
            .transition_status(order.id, order.status, |order| {
                let (amount, entry_type) = match order.payment_type {
                    PaymentType::Full100 => {
                        order.amounts.deposit_paid = order.amounts.deposit;
                        order.amounts.remaining_paid =
                            order.amounts.total - order.amounts.deposit;
                        order.amounts.escrow_amount += order.amounts.total;
                        (order.amounts.total, LedgerEntryType::FullPayment)
                    }
                    PaymentType::Deposit10 => {
                        order.amounts.deposit_paid = order.amounts.deposit;
                        order.amounts.escrow_amount += order.amounts.deposit;
                        (order.amounts.deposit, LedgerEntryType::DepositPayment)
                    }
                };
                order.push_entry(LedgerEntry::new(
                    entry_type,
                    amount,
                    LedgerEntryStatus::Completed,
                    None,
                    now,
                ));
                order.status = OrderStatus::WaitingSellerConfirmation;
                Ok(())
            })
            .await?;

        tracing::info!(
            order_code = %paid.order_code,
            escrow = paid.amounts.escrow_amount,
            "Payment collected into escrow"
        );

        self.notify_quietly(
            paid.seller_id,
            "order.paid",
            "Payment received",
            &format!("Order {} is waiting for your confirmation", paid.order_code),
            serde_json::json!({ "order_id": paid.id, "escrow": paid.amounts.escrow_amount }),
        )
        .await;

        Ok(paid)
    }

    async fn collect_remaining_payment(
        &self,
        order: Order,
        now: DateTime<Utc>,
    ) -> Result<Order, ApiError> {
        let paid = self
            .ledger
            .transition_status(
                order.id,
                OrderStatus::WaitingRemainingPayment,
                |order| {
                    let remaining = order.remaining_due();
                    order.amounts.remaining_paid = remaining;
                    order.amounts.escrow_amount += remaining;
                    order.buyer_confirmed_at = Some(now);
                    order.push_entry(LedgerEntry::new(
                        LedgerEntryType::RemainingPayment,
                        remaining,
                        LedgerEntryStatus::Completed,
                        None,
                        now,
                    ));
                    order.status = OrderStatus::Completed;
                    Ok(())
                },
            )
            .await?;

        tracing::info!(
            order_code = %paid.order_code,
            escrow = paid.amounts.escrow_amount,
            "Remaining balance collected, order completed"
        );

        self.flip_listing(
            paid.listing_id,
            ListingStatus::Reserved,
            ListingStatus::Sold,
        )
        .await;

        self.notify_quietly(
            paid.seller_id,
            "order.completed",
            "Order completed",
            &format!(
                "Order {} is fully paid; funds release after the cooling-off period",
                paid.order_code
            ),
            serde_json::json!({ "order_id": paid.id, "escrow": paid.amounts.escrow_amount }),
        )
        .await;

        Ok(paid)
    }

    async fn cancel_with_refund(
        &self,
        order: Order,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Order, ApiError> {
        let mut refunded: i64 = 0;

        let cancelled = self
            .ledger
            .transition_status(order.id, order.status, |order| {
                refunded = order.amounts.escrow_amount;
                if refunded > 0 {
                    order.push_entry(LedgerEntry::new(
                        LedgerEntryType::Refund,
                        refunded,
                        LedgerEntryStatus::Completed,
                        Some("Cancelled by buyer".to_string()),
                        now,
                    ));
                }
                order.amounts.deposit_paid = 0;
                order.amounts.remaining_paid = 0;
                order.amounts.escrow_amount = 0;
                order.cancelled_at = Some(now);
                order.cancel_reason =
                    Some(reason.unwrap_or_else(|| "Cancelled by buyer".to_string()));
                order.status = OrderStatus::Cancelled;
                Ok(())
            })
            .await?;

        tracing::info!(
            order_code = %cancelled.order_code,
            refunded = refunded,
            "Order cancelled before confirmation"
        );

        self.flip_listing(
            cancelled.listing_id,
            ListingStatus::Reserved,
            ListingStatus::Available,
        )
        .await;

        if refunded > 0 {
            self.send_refund(&cancelled, refunded).await;
        }

        self.notify_quietly(
            cancelled.seller_id,
            "order.cancelled",
            "Order cancelled",
            &format!("The buyer cancelled order {}", cancelled.order_code),
            serde_json::json!({ "order_id": cancelled.id, "refunded": refunded }),
        )
        .await;

        Ok(cancelled)
    }

    async fn cancel_with_forfeiture(
        &self,
        order: Order,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Order, ApiError> {
        let mut forfeited: i64 = 0;

        let cancelled = self
            .ledger
            .transition_status(order.id, order.status, |order| {
                forfeited = order.amounts.escrow_amount;
                if forfeited > 0 {
                    order.push_entry(LedgerEntry::new(
                        LedgerEntryType::Forfeiture,
                        forfeited,
                        LedgerEntryStatus::Completed,
                        Some("Cancelled after seller confirmation".to_string()),
                        now,
                    ));
                }
                order.amounts.released_amount += forfeited;
                order.amounts.escrow_amount = 0;
                order.cancelled_at = Some(now);
                order.cancel_reason =
                    Some(reason.unwrap_or_else(|| "Cancelled by buyer".to_string()));
                order.status = OrderStatus::CancelledByBuyer;
                Ok(())
            })
            .await?;

        tracing::info!(
            order_code = %cancelled.order_code,
            forfeited = forfeited,
            "Order cancelled after confirmation, escrow forfeited"
        );

        self.flip_listing(
            cancelled.listing_id,
            ListingStatus::Reserved,
            ListingStatus::Available,
        )
        .await;

        if forfeited > 0 {
            self.send_credit(&cancelled, forfeited).await;
        }

        self.notify_quietly(
            cancelled.seller_id,
            "order.forfeited",
            "Order cancelled, escrow forfeited to you",
            &format!(
                "The buyer cancelled confirmed order {}; the escrowed amount passes to you",
                cancelled.order_code
            ),
            serde_json::json!({ "order_id": cancelled.id, "forfeited": forfeited }),
        )
        .await;

        Ok(cancelled)
    }

    /// Listing flips are side effects of committed order transitions. On
    /// failure the flip is logged and retried once; it never rolls back the
    /// order mutation.
    async fn flip_listing(&self, listing_id: Uuid, expected: ListingStatus, next: ListingStatus) {
        match self.listings.try_set_status(listing_id, expected, next).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    listing_id = %listing_id,
                    "Listing was not in the expected status during order side effect"
                );
            }
            Err(e) => {
                tracing::warn!(
                    listing_id = %listing_id,
                    error = %e,
                    "Listing status update failed, scheduling retry"
                );
                let listings = Arc::clone(&self.listings);
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    match listings.try_set_status(listing_id, expected, next).await {
                        Ok(true) => {
                            tracing::info!(listing_id = %listing_id, "Listing status retry succeeded")
                        }
                        Ok(false) => tracing::warn!(
                            listing_id = %listing_id,
                            "Listing status retry found unexpected status"
                        ),
                        Err(e) => tracing::error!(
                            listing_id = %listing_id,
                            error = %e,
                            "Listing status retry failed"
                        ),
                    }
                });
            }
        }
    }

    async fn send_refund(&self, order: &Order, amount: i64) {
        if let Err(e) = self
            .funds
            .refund_buyer(order.buyer_id, &order.order_code, amount)
            .await
        {
            tracing::error!(
                order_code = %order.order_code,
                error = %e,
                "Buyer refund failed"
            );
        }
    }

    async fn send_credit(&self, order: &Order, amount: i64) {
        if let Err(e) = self
            .funds
            .credit_seller(order.seller_id, &order.order_code, amount)
            .await
        {
            tracing::error!(
                order_code = %order.order_code,
                error = %e,
                "Seller credit failed"
            );
        }
    }

    async fn notify_quietly(
        &self,
        user_id: Uuid,
        event: &str,
        title: &str,
        content: &str,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self
            .notifier
            .notify(user_id, event, title, content, payload)
            .await
        {
            tracing::warn!(
                user_id = %user_id,
                event = event,
                error = %e,
                "Notification delivery failed"
            );
        }
    }
}

fn payment_entry_type(payment_type: PaymentType) -> LedgerEntryType {
    match payment_type {
        PaymentType::Full100 => LedgerEntryType::FullPayment,
        PaymentType::Deposit10 => LedgerEntryType::DepositPayment,
    }
}
