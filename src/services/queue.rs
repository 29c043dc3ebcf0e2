use std::future::Future;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, RedisResult};
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::models::job::JobMessage;
use crate::services::retry::{self, RetryError, RetryPolicy};

/// A message moved into a consumer's processing list, awaiting ack or reject.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Raw payload exactly as published; needed to remove it on ack.
    pub payload: String,
    /// How many times this message id has been handed to a consumer.
    pub delivery_count: u32,
    processing_key: String,
}

impl Delivery {
    pub fn message(&self) -> Result<JobMessage, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    fn message_id(&self) -> Option<i64> {
        #[derive(serde::Deserialize)]
        struct IdOnly {
            id: i64,
        }
        serde_json::from_str::<IdOnly>(&self.payload).ok().map(|m| m.id)
    }
}

/// Resilient Redis-backed durable queue.
///
/// The queue is a list the producer `LPUSH`es onto. Consumers move messages
/// atomically into their own processing list, so a message is only gone from
/// Redis once it is acknowledged. Blocking receives use their own connection
/// so acks from in-flight work are never queued behind them.
pub struct BrokerManager {
    client: redis::Client,
    queue: String,
    policy: RetryPolicy,
    commands: Mutex<Option<MultiplexedConnection>>,
    receiver: Mutex<Option<MultiplexedConnection>>,
}

impl BrokerManager {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.connection_info()).map_err(BrokerError::Connect)?;
        Ok(Self {
            client,
            queue: config.queue.clone(),
            policy: config.retry_policy(),
            commands: Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.queue)
    }

    fn deliveries_key(&self) -> String {
        format!("{}:deliveries", self.queue)
    }

    fn processing_key(&self, consumer: &str) -> String {
        format!("{}:processing:{}", self.queue, consumer)
    }

    fn heartbeat_key(&self, consumer: &str) -> String {
        format!("{}:consumer:{}", self.queue, consumer)
    }

    /// Consumer id owning a processing list key of this queue.
    fn processing_owner<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.queue.as_str())?
            .strip_prefix(":processing:")
            .filter(|owner| !owner.is_empty())
    }

    async fn open(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.policy
            .run("redis", is_connection_error, || async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                redis::cmd("PING").query_async::<String>(&mut conn).await?;
                Ok::<_, RedisError>(conn)
            })
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => BrokerError::ConnectExhausted {
                    attempts,
                    source: last,
                },
                RetryError::Fatal(e) => BrokerError::Connect(e),
            })
    }

    async fn slot_connection(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
    ) -> Result<MultiplexedConnection, BrokerError> {
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        tracing::info!(queue = %self.queue, "No active Redis connection, connecting");
        let conn = self.open().await?;
        tracing::info!(queue = %self.queue, "Successfully connected to Redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Establish the command connection. Idempotent.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.connection().await.map(|_| ())
    }

    /// Current command connection, reconnecting on demand.
    pub async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.slot_connection(&self.commands).await
    }

    /// Run one command; a connection-level failure reconnects and retries it once.
    async fn run_on<T, F, Fut>(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
        op: F,
    ) -> Result<T, BrokerError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        retry::rerun_once(
            "redis",
            move |fresh| async move {
                if fresh {
                    slot.lock().await.take();
                }
                self.slot_connection(slot).await
            },
            op,
            is_connection_error,
            BrokerError::Redis,
        )
        .await
    }

    /// Publish a job onto the durable queue.
    pub async fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(message)?;
        let queue = self.queue.as_str();
        self.run_on(&self.commands, |mut conn| {
            let payload = payload.as_str();
            async move { conn.lpush::<_, _, ()>(queue, payload).await }
        })
        .await?;
        tracing::info!(queue = %self.queue, request_id = message.id, "Message published");
        Ok(())
    }

    /// Wait up to `timeout` for the next message and move it to `consumer`'s
    /// processing list. Returns `None` on timeout.
    pub async fn receive(
        &self,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let processing_key = self.processing_key(consumer);
        let queue = self.queue.as_str();
        let processing = processing_key.as_str();
        let timeout_secs = timeout.as_secs_f64();

        let payload: Option<String> = self
            .run_on(&self.receiver, |mut conn| async move {
                redis::cmd("BRPOPLPUSH")
                    .arg(queue)
                    .arg(processing)
                    .arg(timeout_secs)
                    .query_async::<Option<String>>(&mut conn)
                    .await
            })
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let mut delivery = Delivery {
            payload,
            delivery_count: 1,
            processing_key,
        };

        // The message is already held in the processing list; losing the
        // counter only delays dead-lettering, so it must not fail the receive.
        if let Some(id) = delivery.message_id() {
            let deliveries = self.deliveries_key();
            let recorded = self
                .run_on(&self.commands, |mut conn| {
                    let deliveries = deliveries.as_str();
                    async move { conn.hincr(deliveries, id, 1).await }
                })
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        queue = %self.queue,
                        request_id = id,
                        error = %e,
                        "Failed to record delivery attempt, counting it as the first"
                    );
                });
            delivery.delivery_count = delivery_count(recorded);
        }

        Ok(Some(delivery))
    }

    /// Acknowledge: the message is removed for good.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let deliveries = self.deliveries_key();
        let id = delivery.message_id();
        self.run_on(&self.commands, |mut conn| {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&delivery.processing_key, 1, &delivery.payload)
                .ignore();
            if let Some(id) = id {
                pipe.hdel(&deliveries, id).ignore();
            }
            async move { pipe.query_async::<()>(&mut conn).await }
        })
        .await
    }

    /// Negative-acknowledge. With `requeue` the message goes back to the head
    /// of the queue for redelivery; otherwise it is moved to the dead-letter list.
    pub async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let dead = self.dead_letter_key();
        let deliveries = self.deliveries_key();
        let queue = self.queue.as_str();
        let id = delivery.message_id();

        self.run_on(&self.commands, |mut conn| {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&delivery.processing_key, 1, &delivery.payload)
                .ignore();
            if requeue {
                pipe.rpush(queue, &delivery.payload).ignore();
            } else {
                pipe.lpush(&dead, &delivery.payload).ignore();
                if let Some(id) = id {
                    pipe.hdel(&deliveries, id).ignore();
                }
            }
            async move { pipe.query_async::<()>(&mut conn).await }
        })
        .await
    }

    /// Return everything left in `consumer`'s processing list to the queue.
    /// Run at consumer start-up so work held by a crashed predecessor with the
    /// same identity is redelivered, and on shutdown for work left undone.
    pub async fn recover(&self, consumer: &str) -> Result<u64, BrokerError> {
        let processing = self.processing_key(consumer);
        let queue = self.queue.as_str();
        let mut recovered = 0;

        loop {
            let moved: Option<String> = self
                .run_on(&self.commands, |mut conn| {
                    let processing = processing.as_str();
                    async move { conn.rpoplpush(processing, queue).await }
                })
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(queue = %self.queue, consumer, recovered, "Requeued unacknowledged messages");
        }
        Ok(recovered)
    }

    /// Mark `consumer` alive for `ttl`. A consumer whose mark has expired is
    /// presumed dead and its processing list may be reclaimed by any peer.
    pub async fn heartbeat(&self, consumer: &str, ttl: Duration) -> Result<(), BrokerError> {
        let key = self.heartbeat_key(consumer);
        let ttl_secs = ttl.as_secs().max(1);
        self.run_on(&self.commands, |mut conn| {
            let key = key.as_str();
            async move { conn.set_ex::<_, _, ()>(key, 1, ttl_secs).await }
        })
        .await
    }

    /// Drop `consumer`'s liveness mark on clean shutdown.
    pub async fn retire(&self, consumer: &str) -> Result<(), BrokerError> {
        let key = self.heartbeat_key(consumer);
        self.run_on(&self.commands, |mut conn| {
            let key = key.as_str();
            async move { conn.del::<_, ()>(key).await }
        })
        .await
    }

    /// Requeue the processing lists of consumers other than `consumer` whose
    /// heartbeat has expired. Covers workers that died and never came back
    /// under the same identity, e.g. pods removed by a scale-down.
    pub async fn reclaim_abandoned(&self, consumer: &str) -> Result<u64, BrokerError> {
        let pattern = format!("{}:processing:*", self.queue);
        let mut owners = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .run_on(&self.commands, |mut conn| {
                    let pattern = pattern.as_str();
                    async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(pattern)
                            .arg("COUNT")
                            .arg(100)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;
            owners.extend(
                keys.iter()
                    .filter_map(|key| self.processing_owner(key))
                    .filter(|owner| *owner != consumer)
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut reclaimed = 0;
        for owner in owners {
            let key = self.heartbeat_key(&owner);
            let alive: bool = self
                .run_on(&self.commands, |mut conn| {
                    let key = key.as_str();
                    async move { conn.exists(key).await }
                })
                .await?;
            if !alive {
                tracing::warn!(queue = %self.queue, consumer = %owner, "Reclaiming work held by a consumer with no heartbeat");
                reclaimed += self.recover(&owner).await?;
            }
        }
        Ok(reclaimed)
    }

    /// Number of messages waiting in the queue.
    pub async fn depth(&self) -> Result<u64, BrokerError> {
        let queue = self.queue.as_str();
        self.run_on(&self.commands, |mut conn| async move { conn.llen(queue).await })
            .await
    }

    /// Number of dead-lettered messages.
    pub async fn dead_letter_depth(&self) -> Result<u64, BrokerError> {
        let dead = self.dead_letter_key();
        self.run_on(&self.commands, |mut conn| {
            let dead = dead.as_str();
            async move { conn.llen(dead).await }
        })
        .await
    }

    /// Check Redis connectivity (for readiness checks).
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        self.run_on(&self.commands, |mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    pub async fn close(&self) {
        self.commands.lock().await.take();
        self.receiver.lock().await.take();
        tracing::info!(queue = %self.queue, "Redis connections closed");
    }
}

/// Delivery count after recording an attempt. A failed recording counts as
/// a first delivery so the message is still processed.
fn delivery_count(recorded: Result<i64, BrokerError>) -> u32 {
    match recorded {
        Ok(count) => u32::try_from(count.max(1)).unwrap_or(u32::MAX),
        Err(_) => 1,
    }
}

/// Errors that mean the connection, not the command, is at fault.
pub fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Could not connect to Redis after {attempts} attempts: {source}")]
    ConnectExhausted { attempts: u32, source: RedisError },

    #[error("Failed to connect to Redis: {0}")]
    Connect(RedisError),

    #[error("Redis error: {0}")]
    Redis(RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
