use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use classifier_pipeline::config::{BrokerConfig, StoreConfig, WorkerConfig};
use classifier_pipeline::db::StoreManager;
use classifier_pipeline::routes;
use classifier_pipeline::services::classifier::HttpClassifier;
use classifier_pipeline::services::consumer::{Consumer, ConsumerSettings};
use classifier_pipeline::services::queue::BrokerManager;
use classifier_pipeline::shutdown;

const DEPTH_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting classification worker");

    let config = WorkerConfig::from_env().expect("Failed to load worker configuration");
    let store_config = StoreConfig::from_env().expect("Failed to load database configuration");
    let broker_config = BrokerConfig::from_env().expect("Failed to load broker configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_histogram!(
        "classification_processing_seconds",
        "Time to classify one image and store the result"
    );
    metrics::describe_counter!("classification_jobs_processed_total", "Jobs classified and stored");
    metrics::describe_counter!("classification_jobs_requeued_total", "Deliveries put back for retry");
    metrics::describe_counter!("classification_jobs_failed_total", "Jobs marked failed and dead-lettered");
    metrics::describe_counter!("classification_messages_malformed_total", "Undecodable messages dead-lettered");
    metrics::describe_counter!("classification_messages_orphaned_total", "Messages whose request row is missing");
    metrics::describe_counter!(
        "classification_messages_reclaimed_total",
        "Messages requeued from workers whose heartbeat lapsed"
    );
    metrics::describe_gauge!("classification_queue_depth", "Messages waiting in the job queue");
    metrics::describe_gauge!("classification_dead_letter_depth", "Messages in the dead-letter list");

    let ops = routes::ops_router(Arc::new(prometheus_handle));
    let listener = tokio::net::TcpListener::bind(&config.metrics_addr)
        .await
        .expect("Failed to bind metrics address");
    tracing::info!("Metrics listening on {}", config.metrics_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, ops).await {
            tracing::error!(error = %e, "Metrics server stopped");
        }
    });

    tracing::info!(host = %store_config.host, database = %store_config.name, "Connecting to PostgreSQL");
    let store = StoreManager::new(store_config);
    store.connect().await.expect("Failed to connect to database");

    let broker = Arc::new(BrokerManager::new(&broker_config).expect("Invalid broker configuration"));

    tokio::spawn(report_queue_depth(Arc::clone(&broker)));

    let settings = ConsumerSettings {
        worker_id: config.worker_id.clone(),
        prefetch: config.prefetch,
        max_deliveries: config.max_deliveries,
        inference_timeout: config.inference_timeout(),
        heartbeat_ttl: config.heartbeat_ttl(),
        shutdown_grace: config.shutdown_grace(),
    };
    let classifier = Arc::new(HttpClassifier::new(&config.inference_url));
    let store = Arc::new(store);
    let consumer = Arc::new(Consumer::new(Arc::clone(&broker), store.clone(), classifier, settings));

    if let Err(e) = consumer.run(shutdown::signal()).await {
        tracing::error!(error = %e, "Worker stopped");
        std::process::exit(1);
    }

    broker.close().await;
    store.close().await;
    tracing::info!("Classification worker stopped");
}

async fn report_queue_depth(broker: Arc<BrokerManager>) {
    loop {
        match broker.depth().await {
            Ok(depth) => metrics::gauge!("classification_queue_depth").set(depth as f64),
            Err(e) => tracing::debug!(error = %e, "Failed to read queue depth"),
        }
        if let Ok(depth) = broker.dead_letter_depth().await {
            metrics::gauge!("classification_dead_letter_depth").set(depth as f64);
        }
        sleep(DEPTH_POLL_INTERVAL).await;
    }
}
