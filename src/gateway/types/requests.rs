//! Request and response DTOs for the spike endpoints

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::models::{Product, SpikeEvent, SpikeOrder};
use crate::repository::OrderStats;
use crate::stock::StockInfo;

/// POST /api/v1/spike/participate
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ParticipateRequest {
    pub spike_event_id: i64,
    #[validate(range(min = 1, max = 10))]
    pub quantity: i64,
    #[validate(length(min = 1, max = 64))]
    pub idempotency_key: String,
}

/// GET /api/v1/spike/events query string
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListEventsQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// start_at | created_at | spike_price
    pub sort_by: Option<String>,
    /// asc | desc
    pub sort_order: Option<String>,
}

/// GET /api/v1/spike/orders query string
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListOrdersQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// pending | paid | cancelled | expired
    pub status: Option<String>,
}

/// POST /api/v1/spike/orders/{id}/cancel
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: String,
}

/// Event as listed, with the live fast-counter remaining.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EventSummary {
    pub id: i64,
    pub product_id: i64,
    pub spike_price: Decimal,
    pub original_price: Decimal,
    pub spike_stock: i64,
    pub remaining: i64,
    pub sold_out: bool,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: String,
}

impl EventSummary {
    pub fn from_parts(event: &SpikeEvent, info: &StockInfo) -> Self {
        Self {
            id: event.id,
            product_id: event.product_id,
            spike_price: event.spike_price,
            original_price: event.original_price,
            spike_stock: event.spike_stock,
            remaining: info.available(),
            sold_out: info.sold_out,
            start_at: event.start_at,
            end_at: event.end_at,
            status: event.status.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EventDetail {
    #[serde(flatten)]
    pub summary: EventSummary,
    pub sold_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EventStats {
    pub spike_event_id: i64,
    pub spike_stock: i64,
    pub sold_count: i64,
    pub remaining: i64,
    pub orders: OrderStats,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Order as returned to its owner.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderView {
    pub id: i64,
    pub spike_event_id: i64,
    pub order_id: Option<i64>,
    pub quantity: i64,
    pub spike_price: Decimal,
    pub total_amount: Decimal,
    pub status: String,
    pub idempotency_key: String,
    pub expire_at: DateTime<Utc>,
    pub can_pay: bool,
    pub can_cancel: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&SpikeOrder> for OrderView {
    fn from(order: &SpikeOrder) -> Self {
        let now = Utc::now();
        Self {
            id: order.id,
            spike_event_id: order.spike_event_id,
            order_id: order.order_id,
            quantity: order.quantity,
            spike_price: order.spike_price,
            total_amount: order.total_amount,
            status: order.status.as_str().to_string(),
            idempotency_key: order.idempotency_key.clone(),
            expire_at: order.expire_at,
            can_pay: order.can_pay(now),
            can_cancel: order.can_cancel(),
            created_at: order.created_at,
        }
    }
}
