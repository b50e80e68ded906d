//! Order route definitions

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/api/orders", post(create_order).get(list_orders))
        .route("/api/orders/me", get(get_my_orders))
        .route("/api/orders/:id", get(get_order))
        .route("/api/orders/:id/pay", post(pay_order))
        .route("/api/orders/:id/confirm", put(confirm_order))
        .route("/api/orders/:id/reject", put(reject_order))
        .route("/api/orders/:id/cancel", put(cancel_order))
        .route("/api/orders/:id/receive", put(receive_order))
        .route("/api/orders/:id/dispute", put(dispute_order))
        .route("/api/orders/:id/fulfillment", put(advance_fulfillment))
        .route("/api/orders/:id/review", post(review_order))
}
