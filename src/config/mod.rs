use std::time::Duration;

use serde::Deserialize;

use crate::services::retry::RetryPolicy;

/// Postgres settings, read from `DB_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Target database; created through the `postgres` maintenance database if absent.
    #[serde(default = "default_db_name")]
    pub name: String,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default = "default_db_password")]
    pub password: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// Redis broker settings, read from `BROKER_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Name of the durable job queue.
    #[serde(default = "default_queue")]
    pub queue: String,

    pub username: Option<String>,

    pub password: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// Producer API process settings.
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest accepted upload, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Consumer worker process settings.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Model-serving endpoint that accepts raw image bytes.
    pub inference_url: String,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Maximum number of unacknowledged messages held at once.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Deliveries after which a failing message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Identity of this consumer's processing list. Defaults to the pod hostname.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Seconds a worker's liveness mark lives without a refresh.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,

    /// Seconds shutdown waits for in-flight messages.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

/// Autoscaler control loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
    pub prometheus_url: String,

    /// PromQL range used for the latency moving average, e.g. "5m".
    #[serde(default = "default_moving_average_duration")]
    pub moving_average_duration: String,

    /// Seconds between iterations.
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: u64,

    pub deployment_name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub latency_threshold_up: f64,

    pub latency_threshold_down: f64,

    /// Requests per minute above which the fleet grows.
    pub count_threshold: f64,

    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,

    pub max_replicas: i32,

    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_kube_api_url")]
    pub kube_api_url: String,

    #[serde(default = "default_kube_token_path")]
    pub kube_token_path: String,

    pub kube_ca_path: Option<String>,

    #[serde(default = "default_autoscaler_bind_addr")]
    pub bind_addr: String,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "resnet18_db".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_password() -> String {
    "password".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    6379
}

fn default_queue() -> String {
    "requests_queue".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_prefetch() -> usize {
    5
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_worker_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string())
}

fn default_heartbeat_ttl_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    25
}

fn default_metrics_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_moving_average_duration() -> String {
    "5m".to_string()
}

fn default_cooldown_period() -> u64 {
    60
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_min_replicas() -> i32 {
    1
}

fn default_max_failures() -> u32 {
    3
}

fn default_kube_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_kube_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_autoscaler_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid autoscaler configuration: {0}")]
    Invalid(String),
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::prefixed("DB_").from_env()?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::prefixed("BROKER_").from_env()?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }

    /// Connection parameters for the redis client. Credentials are passed as
    /// fields, never spliced into a URL, so any character is allowed in them.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl AutoscalerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Thresholds must leave a dead band and replica bounds must be ordered,
    /// otherwise the loop would oscillate or never settle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency_threshold_down >= self.latency_threshold_up {
            return Err(ConfigError::Invalid(format!(
                "latency_threshold_down ({}) must be below latency_threshold_up ({})",
                self.latency_threshold_down, self.latency_threshold_up
            )));
        }
        if self.min_replicas < 0 || self.min_replicas > self.max_replicas {
            return Err(ConfigError::Invalid(format!(
                "replica bounds [{}, {}] are not a valid range",
                self.min_replicas, self.max_replicas
            )));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_period)
    }
}
