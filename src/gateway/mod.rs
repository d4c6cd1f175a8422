//! HTTP gateway
//!
//! Route layout:
//! - public: health, event listings
//! - authenticated: participate, own orders, cancel
//! - admin: warmup
//!
//! Auth is a bearer token validated by [`crate::auth`]; handlers read
//! the injected [`crate::auth::AuthenticatedUser`] extension.

pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tokio::net::TcpListener;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{admin_middleware, auth_middleware};
use state::AppState;

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/v1/health", get(handlers::health::health_check))
        .route("/api/v1/spike/events", get(handlers::spike::list_events))
        .route(
            "/api/v1/spike/events/{id}",
            get(handlers::spike::event_detail),
        )
        .route(
            "/api/v1/spike/events/{id}/stats",
            get(handlers::spike::event_stats),
        );

    let authed = Router::new()
        .route("/api/v1/spike/participate", post(handlers::spike::participate))
        .route("/api/v1/spike/orders", get(handlers::spike::list_orders))
        .route("/api/v1/spike/orders/{id}", get(handlers::spike::get_order))
        .route(
            "/api/v1/spike/orders/{id}/cancel",
            post(handlers::spike::cancel_order),
        )
        .route_layer(from_fn_with_state(Arc::clone(&state), auth_middleware));

    let admin = Router::new()
        .route(
            "/api/v1/admin/spike/events/{id}/warmup",
            post(handlers::admin::warmup),
        )
        .route_layer(from_fn_with_state(Arc::clone(&state), admin_middleware));

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(admin)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
