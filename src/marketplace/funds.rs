//! Fund movement gateway.
//!
//! Escrow accounting lives on the order row; actual money movement goes
//! through this gateway. The logging implementation records the movement
//! until payout rails are wired in.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ApiError;

/// Outbound money movements triggered by settlement.
#[async_trait]
pub trait FundsGateway: Send + Sync {
    /// Pay the seller their share of a released or forfeited escrow.
    async fn credit_seller(
        &self,
        seller_id: Uuid,
        order_code: &str,
        amount: i64,
    ) -> Result<(), ApiError>;

    /// Return held funds to the buyer on refund.
    async fn refund_buyer(
        &self,
        buyer_id: Uuid,
        order_code: &str,
        amount: i64,
    ) -> Result<(), ApiError>;
}

/// Gateway that logs movements instead of calling a payment provider.
#[derive(Debug, Clone, Default)]
pub struct LoggingFundsGateway;

#[async_trait]
impl FundsGateway for LoggingFundsGateway {
    async fn credit_seller(
        &self,
        seller_id: Uuid,
        order_code: &str,
        amount: i64,
    ) -> Result<(), ApiError> {
        tracing::info!(
            seller_id = %seller_id,
            order_code = %order_code,
            amount = amount,
            "Crediting seller from escrow"
        );
        Ok(())
    }

    async fn refund_buyer(
        &self,
        buyer_id: Uuid,
        order_code: &str,
        amount: i64,
    ) -> Result<(), ApiError> {
        tracing::info!(
            buyer_id = %buyer_id,
            order_code = %order_code,
            amount = amount,
            "Refunding buyer from escrow"
        );
        Ok(())
    }
}
