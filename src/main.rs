use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use classifier_pipeline::app_state::AppState;
use classifier_pipeline::config::{ApiConfig, BrokerConfig, StoreConfig};
use classifier_pipeline::db::StoreManager;
use classifier_pipeline::routes::{self, latency::REQUEST_COUNT, latency::REQUEST_LATENCY};
use classifier_pipeline::services::queue::BrokerManager;
use classifier_pipeline::shutdown;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = ApiConfig::from_env().expect("Failed to load API configuration");
    let store_config = StoreConfig::from_env().expect("Failed to load database configuration");
    let broker_config = BrokerConfig::from_env().expect("Failed to load broker configuration");

    tracing::info!("Initializing classification API");

    let prometheus_handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_LATENCY.to_string()), LATENCY_BUCKETS)
        .expect("Invalid latency buckets")
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_histogram!(REQUEST_LATENCY, "Request latency");
    metrics::describe_counter!(REQUEST_COUNT, "Request count by method, endpoint and status");
    metrics::describe_counter!(
        "classification_requests_total",
        "Classification requests accepted and queued"
    );
    metrics::describe_counter!(
        "classification_publish_failures_total",
        "Requests whose job could not be published"
    );
    metrics::describe_counter!(
        "classification_orphaned_requests_total",
        "Unpublished requests that could not be marked failed"
    );

    tracing::info!(host = %store_config.host, database = %store_config.name, "Connecting to PostgreSQL");
    let store = StoreManager::new(store_config);
    store.connect().await.expect("Failed to connect to database");

    tracing::info!(host = %broker_config.host, queue = %broker_config.queue, "Connecting to Redis");
    let broker = BrokerManager::new(&broker_config).expect("Invalid broker configuration");
    broker.connect().await.expect("Failed to connect to broker");

    let state = AppState::new(store, broker);

    let app = routes::api_router(state.clone(), prometheus_handle)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal())
        .await
        .expect("Server error");

    state.broker.close().await;
    state.store.close().await;
    tracing::info!("Classification API stopped");
}
