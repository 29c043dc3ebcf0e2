pub mod error;
pub mod health;
pub mod latency;
pub mod metrics;
pub mod predict;
pub mod results;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::app_state::AppState;

/// Producer API routes. Latency is recorded per matched route.
pub fn api_router(state: AppState, prometheus_handle: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route(
            "/predict",
            get(predict::get_prediction).post(predict::submit_prediction),
        )
        .route("/results", get(results::get_results))
        .route("/ready", get(health::readiness_check))
        .route_layer(middleware::from_fn(latency::track_latency))
        .with_state(state)
        .merge(ops_router(prometheus_handle))
}

/// Liveness and scrape endpoints shared by every binary.
pub fn ops_router(prometheus_handle: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus_handle),
        )
}
