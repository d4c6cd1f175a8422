//! Spike endpoints: participate, events, orders

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use validator::Validate;

use super::trace_id_from;
use crate::auth::AuthenticatedUser;
use crate::gateway::state::AppState;
use crate::gateway::types::{
    ApiError, ApiResponse, ApiResult, CancelOrderRequest, EventDetail, EventStats, EventSummary,
    ListEventsQuery, ListOrdersQuery, OrderView, PagedResponse, ParticipateRequest, ok,
};
use crate::models::SpikeOrderStatus;
use crate::repository::{EventSort, Page, SortOrder};
use crate::spike::{ParticipateCommand, ParticipateReply};

/// Participate in a spike event
///
/// POST /api/v1/spike/participate
#[utoipa::path(
    post,
    path = "/api/v1/spike/participate",
    request_body = ParticipateRequest,
    responses(
        (status = 200, description = "Admission decision; success=false carries the rejection message", body = ParticipateReply),
        (status = 400, description = "Invalid parameters"),
        (status = 401, description = "Authentication failed"),
        (status = 500, description = "Limiter or store failure")
    ),
    security(("bearer_auth" = [])),
    tag = "Spike"
)]
pub async fn participate(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    Json(req): Json<ParticipateRequest>,
) -> ApiResult<ParticipateReply> {
    req.validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let trace_id = trace_id_from(&headers);
    let request_id = state.next_request_id();

    let cmd = ParticipateCommand {
        spike_event_id: req.spike_event_id,
        quantity: req.quantity,
        idempotency_key: req.idempotency_key,
    };

    let reply = state
        .service
        .participate(user.user_id, cmd, &trace_id)
        .await
        .map_err(ApiError::from)?;

    Ok((
        StatusCode::OK,
        Json(ApiResponse::success(reply).traced(request_id, trace_id)),
    ))
}

/// List active spike events
///
/// GET /api/v1/spike/events
#[utoipa::path(
    get,
    path = "/api/v1/spike/events",
    params(ListEventsQuery),
    responses(
        (status = 200, description = "Active events with live remaining stock"),
        (status = 400, description = "Invalid sort parameters")
    ),
    tag = "Spike"
)]
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<PagedResponse<EventSummary>> {
    let page = Page::new(query.page.unwrap_or(1), query.page_size.unwrap_or(20));

    let sort = match query.sort_by.as_deref() {
        None => EventSort::default(),
        Some(s) => EventSort::parse(s)
            .ok_or_else(|| ApiError::bad_request(format!("unknown sort_by {:?}", s)))?,
    };
    let order = match query.sort_order.as_deref() {
        None => SortOrder::default(),
        Some(s) => SortOrder::parse(s)
            .ok_or_else(|| ApiError::bad_request(format!("unknown sort_order {:?}", s)))?,
    };

    let events = state
        .service
        .list_events(page, sort, order)
        .await
        .map_err(ApiError::from)?;

    let items: Vec<EventSummary> = events
        .iter()
        .map(|(event, info)| EventSummary::from_parts(event, info))
        .collect();
    let total = items.len() as i64;

    ok(PagedResponse {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    })
}

/// Spike event detail with product and live remaining stock
///
/// GET /api/v1/spike/events/{id}
#[utoipa::path(
    get,
    path = "/api/v1/spike/events/{id}",
    params(("id" = i64, Path, description = "Spike event ID")),
    responses(
        (status = 200, description = "Event detail"),
        (status = 404, description = "Event not found")
    ),
    tag = "Spike"
)]
pub async fn event_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<EventDetail> {
    let (event, product, info) = state
        .service
        .event_detail(id)
        .await
        .map_err(ApiError::from)?;

    ok(EventDetail {
        summary: EventSummary::from_parts(&event, &info),
        sold_count: event.sold_count,
        product,
    })
}

/// Per-event sale statistics
///
/// GET /api/v1/spike/events/{id}/stats
#[utoipa::path(
    get,
    path = "/api/v1/spike/events/{id}/stats",
    params(("id" = i64, Path, description = "Spike event ID")),
    responses(
        (status = 200, description = "Totals, sold, remaining and per-status order counts"),
        (status = 404, description = "Event not found")
    ),
    tag = "Spike"
)]
pub async fn event_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<EventStats> {
    let (event, orders, info) = state
        .service
        .event_stats(id)
        .await
        .map_err(ApiError::from)?;

    ok(EventStats {
        spike_event_id: event.id,
        spike_stock: event.spike_stock,
        sold_count: event.sold_count,
        remaining: info.available(),
        orders,
    })
}

/// The caller's spike orders
///
/// GET /api/v1/spike/orders
#[utoipa::path(
    get,
    path = "/api/v1/spike/orders",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Paged orders of the authenticated user"),
        (status = 400, description = "Invalid status filter"),
        (status = 401, description = "Authentication failed")
    ),
    security(("bearer_auth" = [])),
    tag = "Spike"
)]
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListOrdersQuery>,
) -> ApiResult<PagedResponse<OrderView>> {
    let page = Page::new(query.page.unwrap_or(1), query.page_size.unwrap_or(20));

    let status = match query.status.as_deref() {
        None => None,
        Some("pending") => Some(SpikeOrderStatus::Pending),
        Some("paid") => Some(SpikeOrderStatus::Paid),
        Some("cancelled") => Some(SpikeOrderStatus::Cancelled),
        Some("expired") => Some(SpikeOrderStatus::Expired),
        Some(other) => {
            return ApiError::bad_request(format!("unknown status {:?}", other)).into_err();
        }
    };

    let (orders, total) = state
        .service
        .list_orders(user.user_id, status, page)
        .await
        .map_err(ApiError::from)?;

    ok(PagedResponse {
        items: orders.iter().map(OrderView::from).collect(),
        total,
        page: page.page,
        page_size: page.page_size,
    })
}

/// Order detail (owner only)
///
/// GET /api/v1/spike/orders/{id}
#[utoipa::path(
    get,
    path = "/api/v1/spike/orders/{id}",
    params(("id" = i64, Path, description = "Spike order ID")),
    responses(
        (status = 200, description = "Order detail"),
        (status = 403, description = "Caller does not own this order"),
        (status = 404, description = "Order not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Spike"
)]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<OrderView> {
    let order = state
        .service
        .get_order(user.user_id, id)
        .await
        .map_err(ApiError::from)?;
    ok(OrderView::from(&order))
}

/// Cancel a pending (or expired) order
///
/// POST /api/v1/spike/orders/{id}/cancel
#[utoipa::path(
    post,
    path = "/api/v1/spike/orders/{id}/cancel",
    params(("id" = i64, Path, description = "Spike order ID")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Cancellation accepted; compensation is asynchronous"),
        (status = 400, description = "Order state does not allow cancellation"),
        (status = 403, description = "Caller does not own this order"),
        (status = 404, description = "Order not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Spike"
)]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CancelOrderRequest>,
) -> ApiResult<()> {
    let trace_id = trace_id_from(&headers);

    state
        .service
        .cancel_order(user.user_id, id, &req.reason, &trace_id)
        .await
        .map_err(ApiError::from)?;

    ok(())
}
