use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Time-series backend the autoscaler reads from.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Evaluate an instant query. `None` means the backend answered but had
    /// no usable sample.
    async fn query(&self, expression: &str) -> Result<Option<f64>, TelemetryError>;
}

/// Prometheus HTTP API client (`/api/v1/query`).
pub struct PrometheusClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    data: Option<QueryData>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    result: Vec<Sample>,
}

#[derive(Deserialize)]
struct Sample {
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TelemetrySource for PrometheusClient {
    async fn query(&self, expression: &str) -> Result<Option<f64>, TelemetryError> {
        tracing::debug!(query = expression, "Querying Prometheus");
        let response: QueryResponse = self
            .http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", expression)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let value = parse_first_sample(response)?;
        match value {
            Some(v) => tracing::debug!(query = expression, value = v, "Value extracted"),
            None => tracing::warn!(query = expression, "No results found for query"),
        }
        Ok(value)
    }
}

/// First sample of an instant vector. NaN (e.g. 0/0 with no traffic) and
/// infinities count as no data.
fn parse_first_sample(response: QueryResponse) -> Result<Option<f64>, TelemetryError> {
    if response.status != "success" {
        return Err(TelemetryError::Backend(
            response.error.unwrap_or_else(|| response.status.clone()),
        ));
    }

    let Some(sample) = response.data.and_then(|d| d.result.into_iter().next()) else {
        return Ok(None);
    };

    let value: f64 = sample
        .value
        .1
        .parse()
        .map_err(|_| TelemetryError::Parse(sample.value.1.clone()))?;

    Ok(value.is_finite().then_some(value))
}

/// Latency moving average over `window`, maxed over the last minute, for
/// the inference endpoint.
pub fn latency_query(window: &str) -> String {
    format!(
        "max(max_over_time(sum by (namespace, pod) (\
         rate(request_latency_seconds_sum{{endpoint='/predict'}}[{window}]) / \
         rate(request_latency_seconds_count{{endpoint='/predict'}}[{window}])\
         )[1m:]))"
    )
}

/// Requests to the inference endpoint over the last minute.
pub fn request_rate_query() -> String {
    "sum(increase(request_latency_seconds_count{endpoint='/predict'}[1m]))".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Prometheus returned an error: {0}")]
    Backend(String),

    #[error("Unparseable sample value: {0}")]
    Parse(String),
}
