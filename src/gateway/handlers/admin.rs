//! Admin endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use serde::Serialize;
use utoipa::ToSchema;

use crate::gateway::state::AppState;
use crate::gateway::types::{ApiError, ApiResult, ok};

#[derive(Debug, Serialize, ToSchema)]
pub struct WarmupResponse {
    pub spike_event_id: i64,
    /// Counter value loaded into the fast store.
    pub stock: i64,
}

/// Preload the fast counter for an event
///
/// POST /api/v1/admin/spike/events/{id}/warmup
///
/// Idempotent: repeating it resets the counter to
/// `spike_stock - sold_count` and clears the sold-out latch.
#[utoipa::path(
    post,
    path = "/api/v1/admin/spike/events/{id}/warmup",
    params(("id" = i64, Path, description = "Spike event ID")),
    responses(
        (status = 200, description = "Counter warmed", body = WarmupResponse),
        (status = 401, description = "Authentication failed"),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Event not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn warmup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<WarmupResponse> {
    let stock = state.service.warmup(id).await.map_err(ApiError::from)?;
    ok(WarmupResponse {
        spike_event_id: id,
        stock,
    })
}
