use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use crate::db::queries::Transition;
use crate::db::{StoreError, StoreManager};
use crate::models::job::JobMessage;
use crate::services::classifier::{top_prediction, Classifier, InferenceError};
use crate::services::queue::{BrokerError, BrokerManager, Delivery};

/// How long one blocking receive waits before the loop polls again.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after the broker itself fails.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Heartbeats per TTL, so a single missed beat does not expire the mark.
const BEATS_PER_TTL: u32 = 3;

/// Only the best label is stored.
const TOP_K: usize = 1;

/// The slice of the request store the consumer writes to.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn mark_processed(&self, id: i64, label: &str, confidence: f64)
        -> Result<Transition, StoreError>;

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<Transition, StoreError>;
}

#[async_trait]
impl ResultStore for StoreManager {
    async fn mark_processed(
        &self,
        id: i64,
        label: &str,
        confidence: f64,
    ) -> Result<Transition, StoreError> {
        StoreManager::mark_processed(self, id, label, confidence).await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<Transition, StoreError> {
        StoreManager::mark_failed(self, id, reason).await
    }
}

/// What to tell the broker about a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject and put back for redelivery.
    Requeue,
    /// Reject for good; the message moves to the dead-letter list.
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub worker_id: String,
    pub prefetch: usize,
    pub max_deliveries: u32,
    pub inference_timeout: Duration,
    /// Lifetime of the liveness mark; peers reclaim this worker's held
    /// messages once it lapses.
    pub heartbeat_ttl: Duration,
    /// How long shutdown waits for in-flight messages before requeueing them.
    pub shutdown_grace: Duration,
}

impl ConsumerSettings {
    fn heartbeat_period(&self) -> Duration {
        (self.heartbeat_ttl / BEATS_PER_TTL).max(Duration::from_millis(100))
    }

    fn permits(&self) -> u32 {
        u32::try_from(self.prefetch.max(1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error("invalid base64 image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

async fn classify_and_store(
    store: &dyn ResultStore,
    classifier: &dyn Classifier,
    settings: &ConsumerSettings,
    message: &JobMessage,
) -> Result<Transition, ProcessError> {
    let image = message.decode_image()?;
    let predictions = timeout(settings.inference_timeout, classifier.classify(&image, TOP_K))
        .await
        .map_err(|_| InferenceError::Timeout(settings.inference_timeout))??;
    let best = top_prediction(predictions)?;

    tracing::info!(request_id = message.id, label = %best.label, confidence = best.score, "Classified image");
    Ok(store.mark_processed(message.id, &best.label, best.score).await?)
}

/// Decide the fate of one delivered payload.
///
/// Never panics on bad input: malformed payloads are dead-lettered, messages
/// whose request row is gone are acknowledged and dropped, and every other
/// failure is requeued until `max_deliveries` is reached.
pub async fn handle_delivery(
    store: &dyn ResultStore,
    classifier: &dyn Classifier,
    settings: &ConsumerSettings,
    payload: &str,
    delivery_count: u32,
) -> Disposition {
    let message: JobMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(error = %e, "Malformed job message, dead-lettering");
            metrics::counter!("classification_messages_malformed_total").increment(1);
            return Disposition::DeadLetter;
        }
    };
    let id = message.id;
    let start = Instant::now();

    let result = classify_and_store(store, classifier, settings, &message).await;

    metrics::histogram!("classification_processing_seconds").record(start.elapsed().as_secs_f64());

    match result {
        Ok(Transition::Applied) => {
            metrics::counter!("classification_jobs_processed_total").increment(1);
            tracing::info!(request_id = id, "Processed request");
            Disposition::Ack
        }
        Ok(Transition::AlreadyFinal(status)) => {
            tracing::warn!(request_id = id, %status, "Duplicate delivery for finished request, acknowledging");
            Disposition::Ack
        }
        Ok(Transition::Missing) => {
            tracing::error!(request_id = id, "Message references a request that does not exist, discarding");
            metrics::counter!("classification_messages_orphaned_total").increment(1);
            Disposition::Ack
        }
        Err(e) if delivery_count >= settings.max_deliveries => {
            tracing::error!(
                request_id = id,
                delivery_count,
                error = %e,
                "Giving up on message after repeated failures"
            );
            let reason = format!("failed after {delivery_count} deliveries: {e}");
            if let Err(store_err) = store.mark_failed(id, &reason).await {
                tracing::error!(request_id = id, error = %store_err, "Failed to mark request as FAILED");
            }
            metrics::counter!("classification_jobs_failed_total").increment(1);
            Disposition::DeadLetter
        }
        Err(e) => {
            tracing::warn!(request_id = id, delivery_count, error = %e, "Failed to process message, requeueing");
            metrics::counter!("classification_jobs_requeued_total").increment(1);
            Disposition::Requeue
        }
    }
}

/// Queue consumer: a single receive loop with at most `prefetch` messages
/// in flight.
pub struct Consumer {
    broker: Arc<BrokerManager>,
    store: Arc<dyn ResultStore>,
    classifier: Arc<dyn Classifier>,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(
        broker: Arc<BrokerManager>,
        store: Arc<dyn ResultStore>,
        classifier: Arc<dyn Classifier>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            store,
            classifier,
            settings,
        }
    }

    /// Consume until `shutdown` resolves, then drain: wait up to the grace
    /// period for in-flight messages, requeue whatever this worker still
    /// holds and drop its liveness mark.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<(), BrokerError> {
        let worker_id = self.settings.worker_id.as_str();
        self.broker.connect().await?;
        self.broker.heartbeat(worker_id, self.settings.heartbeat_ttl).await?;
        self.broker.recover(worker_id).await?;
        self.reclaim().await;

        let keepalive = tokio::spawn(Arc::clone(&self).keep_alive());
        let permits = self.settings.permits();
        let in_flight = Arc::new(Semaphore::new(permits as usize));
        tracing::info!(
            queue = %self.broker.queue_name(),
            worker_id,
            prefetch = permits,
            "Worker is ready to process messages"
        );

        tokio::pin!(shutdown);
        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = self.broker.receive(worker_id, RECEIVE_TIMEOUT) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let consumer = Arc::clone(&self);
                    tokio::spawn(async move {
                        consumer.process(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    tracing::trace!("No messages available");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from broker, backing off");
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }

        keepalive.abort();
        self.drain(&in_flight, permits).await;
        Ok(())
    }

    /// Refresh the liveness mark and periodically reclaim work from peers
    /// whose mark has lapsed.
    async fn keep_alive(self: Arc<Self>) {
        let mut beat = interval(self.settings.heartbeat_period());
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;

        let mut beats: u32 = 0;
        loop {
            beat.tick().await;
            if let Err(e) = self
                .broker
                .heartbeat(&self.settings.worker_id, self.settings.heartbeat_ttl)
                .await
            {
                tracing::warn!(error = %e, "Failed to refresh worker heartbeat");
            }

            beats = beats.wrapping_add(1);
            if beats % BEATS_PER_TTL == 0 {
                self.reclaim().await;
            }
        }
    }

    async fn reclaim(&self) {
        match self.broker.reclaim_abandoned(&self.settings.worker_id).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                metrics::counter!("classification_messages_reclaimed_total").increment(reclaimed);
                tracing::warn!(reclaimed, "Requeued messages abandoned by dead workers");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to reclaim abandoned messages"),
        }
    }

    async fn drain(&self, in_flight: &Semaphore, permits: u32) {
        let worker_id = self.settings.worker_id.as_str();
        tracing::info!(worker_id, "Stopped receiving, waiting for in-flight messages");

        if timeout(self.settings.shutdown_grace, in_flight.acquire_many(permits))
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id,
                grace = ?self.settings.shutdown_grace,
                "Grace period elapsed with messages still in flight"
            );
        }

        if let Err(e) = self.broker.recover(worker_id).await {
            tracing::error!(worker_id, error = %e, "Failed to requeue held messages on shutdown");
        }
        if let Err(e) = self.broker.retire(worker_id).await {
            tracing::warn!(worker_id, error = %e, "Failed to clear worker heartbeat");
        }
        tracing::info!(worker_id, "Worker drained");
    }

    async fn process(&self, delivery: Delivery) {
        let disposition = handle_delivery(
            self.store.as_ref(),
            self.classifier.as_ref(),
            &self.settings,
            &delivery.payload,
            delivery.delivery_count,
        )
        .await;

        let outcome = match disposition {
            Disposition::Ack => self.broker.ack(&delivery).await,
            Disposition::Requeue => self.broker.reject(&delivery, true).await,
            Disposition::DeadLetter => self.broker.reject(&delivery, false).await,
        };

        // An unsettled message stays in the processing list; it is requeued
        // on drain, on restart, or by a peer once the heartbeat lapses.
        if let Err(e) = outcome {
            tracing::error!(error = %e, ?disposition, "Failed to settle message with broker");
        }
    }
}
