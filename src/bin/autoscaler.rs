use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use classifier_pipeline::config::AutoscalerConfig;
use classifier_pipeline::routes;
use classifier_pipeline::services::autoscaler::AutoScaler;
use classifier_pipeline::services::orchestrator::KubernetesScaler;
use classifier_pipeline::services::telemetry::PrometheusClient;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AutoscalerConfig::from_env().expect("Failed to load autoscaler configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_gauge!("autoscaler_replicas", "Last observed or requested replica count");
    metrics::describe_counter!("autoscaler_scale_actions_total", "Scale requests sent, by direction");
    metrics::describe_counter!(
        "autoscaler_metric_failures_total",
        "Iterations where telemetry was unavailable"
    );

    let ops = routes::ops_router(Arc::new(prometheus_handle));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Autoscaler listening on {}", config.bind_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, ops).await {
            tracing::error!(error = %e, "Health server stopped");
        }
    });

    let telemetry = Arc::new(PrometheusClient::new(&config.prometheus_url));
    let controller =
        Arc::new(KubernetesScaler::from_config(&config).expect("Failed to build Kubernetes client"));

    AutoScaler::new(&config, telemetry, controller).run().await;
}
