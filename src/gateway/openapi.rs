//! OpenAPI / Swagger UI documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::gateway::handlers::admin::WarmupResponse;
use crate::gateway::handlers::health::HealthResponse;
use crate::gateway::types::{
    CancelOrderRequest, EventDetail, EventStats, EventSummary, OrderView, ParticipateRequest,
};
use crate::spike::ParticipateReply;

/// Bearer-token security scheme (JWT issued by the auth collaborator).
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Main API documentation struct
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Spike Gate API",
        version = "1.0.0",
        description = "Flash-sale serving core: rate-limited admission, atomic fast stock, asynchronous reconciliation."
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health::health_check,
        crate::gateway::handlers::spike::participate,
        crate::gateway::handlers::spike::list_events,
        crate::gateway::handlers::spike::event_detail,
        crate::gateway::handlers::spike::event_stats,
        crate::gateway::handlers::spike::list_orders,
        crate::gateway::handlers::spike::get_order,
        crate::gateway::handlers::spike::cancel_order,
        crate::gateway::handlers::admin::warmup,
    ),
    components(
        schemas(
            HealthResponse,
            WarmupResponse,
            ParticipateRequest,
            ParticipateReply,
            CancelOrderRequest,
            EventSummary,
            EventDetail,
            EventStats,
            OrderView,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Spike", description = "Flash-sale participation and queries"),
        (name = "Admin", description = "Operational endpoints"),
        (name = "System", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;
