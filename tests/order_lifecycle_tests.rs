//! Order lifecycle tests against a real database.
//!
//! The settlement sweeps scan the whole orders table, so run the ignored
//! tests serially: `cargo test -- --ignored --test-threads=1`.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Duration, Utc};
    use sqlx::PgPool;
    use uuid::Uuid;
    use validator::Validate;

    use velomarket_server::error::ApiError;
    use velomarket_server::marketplace::{
        ListingStatus, LoggingFundsGateway, PgListingProvider, PgNotificationSink, PgUserProvider,
    };
    use velomarket_server::models::UserRole;
    use velomarket_server::orders::{
        CancelOrderRequest, CreateOrderRequest, DisputeOrderRequest, LedgerEntryStatus,
        LedgerEntryType, MyOrdersQuery, Order, OrderLedger, OrderService, OrderSide, OrderStatus,
        PaymentType, RejectOrderRequest, ReviewOrderRequest, SettlementScheduler,
    };
    use velomarket_server::policy::Clock;

    /// Test clock that only moves when told to
    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Utc::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    /// Helper to create a test database pool
    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/velomarket_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    fn build_service(pool: &PgPool, clock: Arc<ManualClock>) -> OrderService {
        OrderService::new(
            OrderLedger::new(pool.clone()),
            Arc::new(PgListingProvider::new(pool.clone())),
            Arc::new(PgUserProvider::new(pool.clone())),
            Arc::new(PgNotificationSink::new(pool.clone())),
            Arc::new(LoggingFundsGateway),
            clock,
        )
    }

    async fn seed_user(pool: &PgPool, name: &str, role: UserRole) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, full_name, email, phone, role, created_at, updated_at)
             VALUES ($1, $2, $3, NULL, $4, NOW(), NOW())",
        )
        .bind(id)
        .bind(name)
        .bind(format!("{}@example.com", id))
        .bind(role)
        .execute(pool)
        .await
        .expect("Failed to seed user");
        id
    }

    async fn seed_listing(pool: &PgPool, seller_id: Uuid, price: i64) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO listings (id, seller_id, title, price, primary_image, condition, status, created_at, updated_at)
             VALUES ($1, $2, 'Cannondale CAAD13 54cm', $3, NULL, 'good', 'AVAILABLE', NOW(), NOW())",
        )
        .bind(id)
        .bind(seller_id)
        .bind(price)
        .execute(pool)
        .await
        .expect("Failed to seed listing");
        id
    }

    async fn listing_status(pool: &PgPool, listing_id: Uuid) -> ListingStatus {
        sqlx::query_scalar("SELECT status FROM listings WHERE id = $1")
            .bind(listing_id)
            .fetch_one(pool)
            .await
            .expect("Failed to read listing status")
    }

    async fn reload(pool: &PgPool, order_id: Uuid) -> Order {
        OrderLedger::new(pool.clone())
            .find_by_id(order_id)
            .await
            .expect("Failed to reload order")
            .expect("Order disappeared")
    }

    fn deposit_request(listing_id: Uuid) -> CreateOrderRequest {
        CreateOrderRequest {
            listing_id,
            payment_type: PaymentType::Deposit10,
            discount_percent: None,
            discount_reason: None,
        }
    }

    fn full_request(listing_id: Uuid) -> CreateOrderRequest {
        CreateOrderRequest {
            listing_id,
            payment_type: PaymentType::Full100,
            discount_percent: None,
            discount_reason: None,
        }
    }

    #[test]
    fn test_request_validation() {
        let bad_discount = CreateOrderRequest {
            listing_id: Uuid::new_v4(),
            payment_type: PaymentType::Deposit10,
            discount_percent: Some(150.0),
            discount_reason: None,
        };
        assert!(bad_discount.validate().is_err());

        let ok = CreateOrderRequest {
            listing_id: Uuid::new_v4(),
            payment_type: PaymentType::Deposit10,
            discount_percent: Some(10.0),
            discount_reason: Some("spring sale".to_string()),
        };
        assert!(ok.validate().is_ok());

        let bad_rating = ReviewOrderRequest {
            rating: 6,
            comment: None,
        };
        assert!(bad_rating.validate().is_err());

        let empty_reason = CancelOrderRequest {
            reason: Some(String::new()),
        };
        assert!(empty_reason.validate().is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_create_deposit_order_reserves_listing() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_000_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");

        assert_eq!(order.status, OrderStatus::ReservedDeposit);
        assert_eq!(order.amounts.total, 1_000_000);
        assert_eq!(order.amounts.deposit, 100_000);
        assert_eq!(order.amounts.escrow_amount, 0);
        assert!(order.order_code.starts_with("ORD-"));
        assert_eq!(
            order.reservation_expires_at - order.reserved_at,
            Duration::hours(48)
        );

        assert_eq!(listing_status(&pool, listing).await, ListingStatus::Reserved);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_full_payment_order_uses_short_window() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 800_000).await;

        let order = service
            .create_order(buyer, full_request(listing))
            .await
            .expect("Order creation should succeed");

        assert_eq!(order.status, OrderStatus::ReservedFull);
        assert_eq!(
            order.reservation_expires_at - order.reserved_at,
            Duration::hours(10)
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_discount_applies_to_deposit_base() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_000_000).await;

        let mut request = deposit_request(listing);
        request.discount_percent = Some(10.0);
        request.discount_reason = Some("returning customer".to_string());

        let order = service
            .create_order(buyer, request)
            .await
            .expect("Order creation should succeed");

        assert_eq!(order.amounts.pricing.original_price, 1_000_000);
        assert_eq!(order.amounts.pricing.discount_amount, 100_000);
        assert_eq!(order.amounts.pricing.final_price, 900_000);
        assert_eq!(order.amounts.total, 900_000);
        assert_eq!(order.amounts.deposit, 90_000);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_cannot_order_own_listing() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 500_000).await;

        let err = service
            .create_order(seller, deposit_request(listing))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_one_active_order_per_listing() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer_a = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let buyer_b = seed_user(&pool, "Noor Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 500_000).await;

        service
            .create_order(buyer_a, deposit_request(listing))
            .await
            .expect("First order should succeed");

        // Second buyer is turned away by the listing status.
        let err = service
            .create_order(buyer_b, deposit_request(listing))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        // Even if the listing status is stale, the unique active-order
        // index still rejects a double reservation.
        sqlx::query("UPDATE listings SET status = 'AVAILABLE' WHERE id = $1")
            .bind(listing)
            .execute(&pool)
            .await
            .expect("Failed to reset listing status");

        let err = service
            .create_order(buyer_b, deposit_request(listing))
            .await
            .unwrap_err();
        match err {
            ApiError::Conflict(message) => {
                assert!(message.contains("active order"), "got: {}", message)
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_deposit_payment_reaches_seller_confirmation() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_000_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");

        // Someone else cannot pay
        let err = service.pay_order(seller, order.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let paid = service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");

        assert_eq!(paid.status, OrderStatus::WaitingSellerConfirmation);
        assert_eq!(paid.amounts.deposit_paid, 100_000);
        assert_eq!(paid.amounts.escrow_amount, 100_000);
        assert_eq!(paid.transactions.0.len(), 1);
        assert_eq!(
            paid.transactions.0[0].entry_type,
            LedgerEntryType::DepositPayment
        );
        assert_eq!(paid.transactions.0[0].status, LedgerEntryStatus::Completed);

        // Paying twice is rejected
        let err = service.pay_order(buyer, order.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let confirmed = service
            .confirm_order(seller, order.id)
            .await
            .expect("Confirmation should succeed");
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert!(confirmed.seller_confirmed_at.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_late_payment_expires_reservation() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_000_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");

        clock.advance(Duration::hours(49));

        let err = service.pay_order(buyer, order.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Expired(_)));

        let expired = reload(&pool, order.id).await;
        assert_eq!(expired.status, OrderStatus::DepositExpired);
        assert_eq!(expired.amounts.escrow_amount, 0);

        // The failed attempt is preserved in the audit trail
        assert_eq!(expired.transactions.0.len(), 1);
        assert_eq!(expired.transactions.0[0].status, LedgerEntryStatus::Failed);
        assert_eq!(expired.transactions.0[0].amount, 100_000);

        assert_eq!(
            listing_status(&pool, listing).await,
            ListingStatus::Available
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_seller_reject_refunds_escrow() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_000_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");

        let rejected = service
            .reject_order(
                seller,
                order.id,
                RejectOrderRequest {
                    reason: Some("Frame already promised locally".to_string()),
                },
            )
            .await
            .expect("Rejection should succeed");

        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(rejected.amounts.escrow_amount, 0);
        assert_eq!(rejected.amounts.deposit_paid, 0);
        assert!(rejected
            .transactions
            .0
            .iter()
            .any(|e| e.entry_type == LedgerEntryType::Refund && e.amount == 100_000));
        assert_eq!(
            rejected.cancel_reason.as_deref(),
            Some("Frame already promised locally")
        );

        assert_eq!(
            listing_status(&pool, listing).await,
            ListingStatus::Available
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_buyer_cancel_before_confirmation_refunds() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 600_000).await;

        let order = service
            .create_order(buyer, full_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");

        let cancelled = service
            .cancel_order(buyer, order.id, CancelOrderRequest::default())
            .await
            .expect("Cancellation should succeed");

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.amounts.escrow_amount, 0);
        assert!(cancelled
            .transactions
            .0
            .iter()
            .any(|e| e.entry_type == LedgerEntryType::Refund && e.amount == 600_000));
        assert_eq!(
            listing_status(&pool, listing).await,
            ListingStatus::Available
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_buyer_cancel_after_confirmation_forfeits_escrow() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_000_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");
        service
            .confirm_order(seller, order.id)
            .await
            .expect("Confirmation should succeed");

        let cancelled = service
            .cancel_order(buyer, order.id, CancelOrderRequest::default())
            .await
            .expect("Cancellation should succeed");

        assert_eq!(cancelled.status, OrderStatus::CancelledByBuyer);
        assert_eq!(cancelled.amounts.escrow_amount, 0);
        assert_eq!(cancelled.amounts.released_amount, 100_000);
        assert!(cancelled
            .transactions
            .0
            .iter()
            .any(|e| e.entry_type == LedgerEntryType::Forfeiture && e.amount == 100_000));
        assert_eq!(
            listing_status(&pool, listing).await,
            ListingStatus::Available
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_deposit_lifecycle_completes_with_remaining_payment() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 2_500_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Deposit payment should succeed");
        service
            .confirm_order(seller, order.id)
            .await
            .expect("Confirmation should succeed");

        // Admin walks the order through fulfillment
        for expected in [
            OrderStatus::WaitingForPickup,
            OrderStatus::InTransit,
            OrderStatus::Delivered,
        ] {
            let advanced = service
                .advance_fulfillment(order.id)
                .await
                .expect("Fulfillment step should succeed");
            assert_eq!(advanced.status, expected);
        }

        let received = service
            .receive_order(buyer, order.id)
            .await
            .expect("Receipt confirmation should succeed");
        assert_eq!(received.status, OrderStatus::WaitingRemainingPayment);
        assert!(received.buyer_confirmed_at.is_none());

        let completed = service
            .pay_order(buyer, order.id)
            .await
            .expect("Remaining payment should succeed");
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(completed.amounts.deposit_paid, 250_000);
        assert_eq!(completed.amounts.remaining_paid, 2_250_000);
        assert_eq!(completed.amounts.escrow_amount, 2_500_000);
        assert!(completed.buyer_confirmed_at.is_some());
        assert_eq!(completed.transactions.0.len(), 2);
        assert_eq!(
            completed.transactions.0[1].entry_type,
            LedgerEntryType::RemainingPayment
        );

        assert_eq!(listing_status(&pool, listing).await, ListingStatus::Sold);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_release_sweep_respects_cooling_off() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = Arc::new(build_service(&pool, clock.clone()));
        let sweeper = SettlementScheduler::new(service.clone(), clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 700_000).await;

        let order = service
            .create_order(buyer, full_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");
        service
            .confirm_order(seller, order.id)
            .await
            .expect("Confirmation should succeed");
        for _ in 0..3 {
            service
                .advance_fulfillment(order.id)
                .await
                .expect("Fulfillment step should succeed");
        }
        let completed = service
            .receive_order(buyer, order.id)
            .await
            .expect("Receipt confirmation should succeed");
        assert_eq!(completed.status, OrderStatus::Completed);

        // 47 hours in: still inside the cooling-off period
        clock.advance(Duration::hours(47));
        sweeper.run_once().await;
        assert_eq!(reload(&pool, order.id).await.status, OrderStatus::Completed);

        // 49 hours in: escrow goes to the seller
        clock.advance(Duration::hours(2));
        sweeper.run_once().await;

        let released = reload(&pool, order.id).await;
        assert_eq!(released.status, OrderStatus::FundsReleased);
        assert_eq!(released.amounts.escrow_amount, 0);
        assert_eq!(released.amounts.released_amount, 700_000);
        assert!(released.funds_released_at.is_some());
        assert!(released
            .transactions
            .0
            .iter()
            .any(|e| e.entry_type == LedgerEntryType::Release && e.amount == 700_000));

        // Running again leaves the order untouched
        let entries_before = released.transactions.0.len();
        sweeper.run_once().await;
        let after = reload(&pool, order.id).await;
        assert_eq!(after.status, OrderStatus::FundsReleased);
        assert_eq!(after.transactions.0.len(), entries_before);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_expiry_sweep_flips_reservations() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = Arc::new(build_service(&pool, clock.clone()));
        let sweeper = SettlementScheduler::new(service.clone(), clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let full_listing = seed_listing(&pool, seller, 400_000).await;
        let deposit_listing = seed_listing(&pool, seller, 900_000).await;

        let full_order = service
            .create_order(buyer, full_request(full_listing))
            .await
            .expect("Order creation should succeed");
        let deposit_order = service
            .create_order(buyer, deposit_request(deposit_listing))
            .await
            .expect("Order creation should succeed");

        // 11 hours: only the full-payment window has closed
        clock.advance(Duration::hours(11));
        sweeper.run_once().await;
        assert_eq!(
            reload(&pool, full_order.id).await.status,
            OrderStatus::PaymentTimeout
        );
        assert_eq!(
            reload(&pool, deposit_order.id).await.status,
            OrderStatus::ReservedDeposit
        );
        assert_eq!(
            listing_status(&pool, full_listing).await,
            ListingStatus::Available
        );

        // 49 hours: the deposit window has closed too
        clock.advance(Duration::hours(38));
        sweeper.run_once().await;
        assert_eq!(
            reload(&pool, deposit_order.id).await.status,
            OrderStatus::DepositExpired
        );
        assert_eq!(
            listing_status(&pool, deposit_listing).await,
            ListingStatus::Available
        );

        // Sweeping again changes nothing
        sweeper.run_once().await;
        assert_eq!(
            reload(&pool, full_order.id).await.status,
            OrderStatus::PaymentTimeout
        );
        assert_eq!(
            reload(&pool, deposit_order.id).await.status,
            OrderStatus::DepositExpired
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_dispute_blocks_release() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = Arc::new(build_service(&pool, clock.clone()));
        let sweeper = SettlementScheduler::new(service.clone(), clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 1_200_000).await;

        let order = service
            .create_order(buyer, full_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");
        service
            .confirm_order(seller, order.id)
            .await
            .expect("Confirmation should succeed");
        for _ in 0..3 {
            service
                .advance_fulfillment(order.id)
                .await
                .expect("Fulfillment step should succeed");
        }

        // Dispute while delivered, before confirming receipt
        let disputed = service
            .dispute_order(
                buyer,
                order.id,
                DisputeOrderRequest {
                    reason: "Fork is bent, not as described".to_string(),
                },
            )
            .await
            .expect("Dispute should succeed");
        assert_eq!(disputed.status, OrderStatus::Disputed);
        assert_eq!(disputed.amounts.escrow_amount, 1_200_000);

        // The release sweep never touches a disputed order
        clock.advance(Duration::hours(72));
        sweeper.run_once().await;
        let after = reload(&pool, order.id).await;
        assert_eq!(after.status, OrderStatus::Disputed);
        assert_eq!(after.amounts.escrow_amount, 1_200_000);

        // A second dispute is rejected
        let err = service
            .dispute_order(
                buyer,
                order.id,
                DisputeOrderRequest {
                    reason: "Still bent".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_review_only_after_completion() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 300_000).await;

        let order = service
            .create_order(buyer, full_request(listing))
            .await
            .expect("Order creation should succeed");
        service
            .pay_order(buyer, order.id)
            .await
            .expect("Payment should succeed");
        service
            .confirm_order(seller, order.id)
            .await
            .expect("Confirmation should succeed");

        let review = ReviewOrderRequest {
            rating: 5,
            comment: Some("Smooth deal, bike as described".to_string()),
        };

        // Too early
        let err = service
            .review_order(
                buyer,
                order.id,
                ReviewOrderRequest {
                    rating: 5,
                    comment: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        for _ in 0..3 {
            service
                .advance_fulfillment(order.id)
                .await
                .expect("Fulfillment step should succeed");
        }
        service
            .receive_order(buyer, order.id)
            .await
            .expect("Receipt confirmation should succeed");

        let reviewed = service
            .review_order(buyer, order.id, review)
            .await
            .expect("Review should succeed");
        let stored = reviewed.review.expect("Review should be stored");
        assert_eq!(stored.rating, 5);

        // One review per order
        let err = service
            .review_order(
                buyer,
                order.id,
                ReviewOrderRequest {
                    rating: 1,
                    comment: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_get_order_access_control() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let stranger = seed_user(&pool, "Olu Stranger", UserRole::Buyer).await;
        let admin = seed_user(&pool, "Ada Admin", UserRole::Admin).await;
        let listing = seed_listing(&pool, seller, 450_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");

        assert!(service
            .get_order(buyer, UserRole::Buyer, order.id)
            .await
            .is_ok());
        assert!(service
            .get_order(seller, UserRole::Seller, order.id)
            .await
            .is_ok());
        assert!(service
            .get_order(admin, UserRole::Admin, order.id)
            .await
            .is_ok());

        let err = service
            .get_order(stranger, UserRole::Buyer, order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_my_orders_lists_both_sides() {
        let pool = setup_test_db().await;
        let clock = ManualClock::new();
        let service = build_service(&pool, clock.clone());

        let buyer = seed_user(&pool, "Maya Buyer", UserRole::Buyer).await;
        let seller = seed_user(&pool, "Sam Seller", UserRole::Seller).await;
        let listing = seed_listing(&pool, seller, 550_000).await;

        let order = service
            .create_order(buyer, deposit_request(listing))
            .await
            .expect("Order creation should succeed");

        let (buyer_orders, buyer_total) = service
            .list_my_orders(
                buyer,
                MyOrdersQuery {
                    side: None,
                    status: None,
                    page: None,
                    limit: None,
                },
            )
            .await
            .expect("Listing should succeed");
        assert!(buyer_total >= 1);
        assert!(buyer_orders.iter().any(|o| o.id == order.id));

        let (seller_orders, _) = service
            .list_my_orders(
                seller,
                MyOrdersQuery {
                    side: Some(OrderSide::Seller),
                    status: Some(OrderStatus::ReservedDeposit),
                    page: Some(1),
                    limit: Some(10),
                },
            )
            .await
            .expect("Listing should succeed");
        assert!(seller_orders.iter().any(|o| o.id == order.id));

        // The seller has bought nothing
        let (as_buyer, _) = service
            .list_my_orders(
                seller,
                MyOrdersQuery {
                    side: Some(OrderSide::Buyer),
                    status: None,
                    page: None,
                    limit: None,
                },
            )
            .await
            .expect("Listing should succeed");
        assert!(as_buyer.iter().all(|o| o.id != order.id));
    }
}
