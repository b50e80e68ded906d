//! Settlement sweep: reservation expiry and escrow release.
//!
//! The sweep runs on a cron schedule and is the sole timeout-enforcement
//! mechanism. Deadlines are wall-clock comparisons against stored
//! timestamps, so missed runs and process restarts lose nothing, and
//! multiple replicas can sweep concurrently because each per-order
//! transition is guarded by the ledger's compare-and-set.

use std::sync::Arc;

use crate::error::ApiError;
use crate::orders::service::OrderService;
use crate::policy::Clock;

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub released: usize,
    pub failures: usize,
}

/// Periodic settlement worker.
#[derive(Clone)]
pub struct SettlementScheduler {
    orders: Arc<OrderService>,
    clock: Arc<dyn Clock>,
}

impl SettlementScheduler {
    pub fn new(orders: Arc<OrderService>, clock: Arc<dyn Clock>) -> Self {
        Self { orders, clock }
    }

    /// Run both sweeps once. Each order is processed independently; one
    /// failure never aborts the rest of the pass.
    pub async fn run_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        self.sweep_expired_reservations(&mut stats).await;
        self.sweep_release_due(&mut stats).await;

        tracing::info!(
            expired = stats.expired,
            released = stats.released,
            failures = stats.failures,
            "Settlement sweep finished"
        );

        stats
    }

    async fn sweep_expired_reservations(&self, stats: &mut SweepStats) {
        let now = self.clock.now();

        let due = match self.orders.expired_reservations(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load expired reservations");
                stats.failures += 1;
                return;
            }
        };

        for order in due {
            match self.orders.expire_reservation(&order).await {
                Ok(_) => stats.expired += 1,
                // Lost the race against a payment or a concurrent sweep.
                Err(ApiError::Conflict(_)) => {
                    tracing::debug!(
                        order_code = %order.order_code,
                        "Reservation already transitioned, skipping"
                    );
                }
                Err(e) => {
                    stats.failures += 1;
                    tracing::error!(
                        order_code = %order.order_code,
                        error = %e,
                        "Failed to expire reservation"
                    );
                }
            }
        }
    }

    async fn sweep_release_due(&self, stats: &mut SweepStats) {
        let now = self.clock.now();

        let due = match self.orders.release_due(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load orders due for release");
                stats.failures += 1;
                return;
            }
        };

        for order in due {
            match self.orders.release_funds(&order).await {
                Ok(_) => stats.released += 1,
                Err(ApiError::Conflict(_)) => {
                    tracing::debug!(
                        order_code = %order.order_code,
                        "Order already released or moved on, skipping"
                    );
                }
                Err(e) => {
                    stats.failures += 1;
                    tracing::error!(
                        order_code = %order.order_code,
                        error = %e,
                        "Failed to release funds"
                    );
                }
            }
        }
    }
}
