//! The Axum application: `AppState`, route table, and middleware stack.
//!
//! Grounded on a thinned `dwctl::lib::build_router` — this gateway has no
//! multi-tenant auth/users/groups/billing/batches surface, so the route table is
//! a single flat `/api` tree rather than nested `auth_routes`/`api_routes`. The
//! CORS layer and the combined domain+transport `/api/metrics` endpoint follow
//! the teacher's pattern directly.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use relay_core::Gateway;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub metric_handle: axum_prometheus::metrics_exporter_prometheus::PrometheusHandle,
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
}

pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
    let state = AppState { gateway, metric_handle };

    let admin_routes = Router::new()
        .route("/provider/{name}/toggle", post(handlers::toggle_provider))
        .route("/cache/stats", get(handlers::cache_stats))
        .route("/cache/clear", post(handlers::cache_clear))
        .route("/cache/cleanup", post(handlers::cache_cleanup))
        .route("/keys", get(handlers::list_keys).post(handlers::create_key))
        .route("/keys/{id}", delete(handlers::delete_key))
        .route("/keys/{id}/{action}", post(handlers::set_key_status))
        .route("/costs/summary", get(handlers::costs_summary))
        .route("/costs/by-provider", get(handlers::costs_by_provider))
        .route("/costs/by-day", get(handlers::costs_by_day));

    let api_routes = Router::new()
        .route("/ask", post(handlers::ask))
        .route("/submit", post(handlers::submit))
        .route("/query/{id}", get(handlers::query))
        .route("/request/{id}", delete(handlers::cancel))
        .route("/requests", get(handlers::list_requests))
        .route("/status", get(handlers::status))
        .route("/ws", get(ws::upgrade))
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/metrics", get(handlers::metrics))
        .nest("/api", api_routes)
        .layer(cors_layer())
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
