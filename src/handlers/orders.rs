//! Order lifecycle API handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiError;
use crate::middleware::{AdminUser, AuthenticatedUser};
use crate::models::{ApiResponse, PaginatedResponse};
use crate::orders::{
    AdminOrdersQuery, CancelOrderRequest, CreateOrderRequest, DisputeOrderRequest, MyOrdersQuery,
    Order, RejectOrderRequest, ReviewOrderRequest,
};
use crate::state::AppState;

/// Place an order on a listing
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    request.validate()?;

    let order = state
        .order_service
        .create_order(user.user_id, request)
        .await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Pay escrow for a reserved order, or settle the remaining balance
pub async fn pay_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = state.order_service.pay_order(user.user_id, id).await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Seller accepts a paid order
pub async fn confirm_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = state.order_service.confirm_order(user.user_id, id).await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Seller declines a paid order, refunding the buyer
pub async fn reject_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    body: Option<Json<RejectOrderRequest>>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;

    let order = state
        .order_service
        .reject_order(user.user_id, id, request)
        .await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Buyer cancels an order. Refund or deposit forfeiture depends on how far
/// the order has progressed.
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelOrderRequest>>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;

    let order = state
        .order_service
        .cancel_order(user.user_id, id, request)
        .await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Buyer confirms receipt of the delivered item
pub async fn receive_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = state.order_service.receive_order(user.user_id, id).await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Buyer raises a dispute, freezing escrowed funds
pub async fn dispute_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<DisputeOrderRequest>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    request.validate()?;

    let order = state
        .order_service
        .dispute_order(user.user_id, id, request)
        .await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Admin moves a confirmed order one fulfillment step forward
pub async fn advance_fulfillment(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = state.order_service.advance_fulfillment(id).await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Buyer reviews a completed order
pub async fn review_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ReviewOrderRequest>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    request.validate()?;

    let order = state
        .order_service
        .review_order(user.user_id, id, request)
        .await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// List the caller's own orders, as buyer or seller
pub async fn get_my_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<MyOrdersQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<Order>>>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let (orders, total) = state
        .order_service
        .list_my_orders(user.user_id, query)
        .await?;

    Ok(Json(ApiResponse::ok(PaginatedResponse {
        data: orders,
        total,
        page,
        limit,
    })))
}

/// Fetch a single order. Only the buyer, the seller, or an admin may look.
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = state
        .order_service
        .get_order(user.user_id, user.role, id)
        .await?;

    Ok(Json(ApiResponse::ok(order)))
}

/// Admin view over all orders with filters
pub async fn list_orders(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<AdminOrdersQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<Order>>>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let (orders, total) = state.order_service.list_orders(query).await?;

    Ok(Json(ApiResponse::ok(PaginatedResponse {
        data: orders,
        total,
        page,
        limit,
    })))
}
