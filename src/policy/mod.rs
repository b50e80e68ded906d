//! Marketplace settlement policy: deposit math, reservation windows,
//! order code generation and the clock abstraction used by the order core.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::orders::PaymentType;

/// Deposit share of the total price for DEPOSIT_10 orders.
pub const DEPOSIT_PERCENT: f64 = 0.10;

/// Hours a buyer has to pay in full after reserving with FULL_100.
pub const FULL_PAYMENT_TIMEOUT_HOURS: i64 = 10;

/// Hours a deposit-backed reservation stays open.
pub const DEPOSIT_RESERVATION_TIMEOUT_HOURS: i64 = 48;

/// Cooling-off period between buyer confirmation and funds release.
pub const FUNDS_RELEASE_DELAY_HOURS: i64 = 48;

/// Maximum orders processed per sweep pass.
pub const SWEEP_BATCH_SIZE: i64 = 100;

/// Deposit owed for a given total, rounded to the nearest minor unit.
pub fn compute_deposit(total: i64, deposit_percent: f64) -> i64 {
    ((total as f64) * deposit_percent).round() as i64
}

/// Discount amount for a percentage off the original price.
/// The percentage is clamped to [0, 100].
pub fn compute_discount(original_price: i64, discount_percent: f64) -> i64 {
    let pct = discount_percent.clamp(0.0, 100.0);
    ((original_price as f64) * pct / 100.0).round() as i64
}

/// How long a fresh reservation stays payable.
pub fn reservation_window(payment_type: PaymentType) -> Duration {
    match payment_type {
        PaymentType::Full100 => Duration::hours(FULL_PAYMENT_TIMEOUT_HOURS),
        PaymentType::Deposit10 => Duration::hours(DEPOSIT_RESERVATION_TIMEOUT_HOURS),
    }
}

/// Delay between buyer confirmation and escrow release.
pub fn release_delay() -> Duration {
    Duration::hours(FUNDS_RELEASE_DELAY_HOURS)
}

/// Generate a human-readable order code: `PREFIX-20250114093012-04217`.
///
/// Uniqueness is ultimately enforced by the database; the random suffix
/// keeps same-second collisions rare.
pub fn generate_order_code(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}-{}-{:05}", prefix, now.format("%Y%m%d%H%M%S"), suffix)
}

/// Source of the current time. Injected so deadline logic can be tested
/// without waiting out real reservation windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
