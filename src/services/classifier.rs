use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// One ranked label from the inference engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub score: f64,
}

/// The external inference engine: raw image bytes in, labels ranked by
/// score (descending) out.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &[u8], top_k: usize) -> Result<Vec<Prediction>, InferenceError>;
}

/// Client for a model-serving endpoint that accepts the raw image as the
/// request body and answers with `[{"label": ..., "score": ...}, ...]`.
pub struct HttpClassifier {
    http: Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &[u8], top_k: usize) -> Result<Vec<Prediction>, InferenceError> {
        let response = self
            .http
            .post(&self.url)
            .query(&[("topk", top_k)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Engine(format!("{status}: {body}")));
        }

        Ok(response.json::<Vec<Prediction>>().await?)
    }
}

/// Pick the highest-scoring entry, rejecting empty results and scores
/// outside [0, 1].
pub fn top_prediction(predictions: Vec<Prediction>) -> Result<Prediction, InferenceError> {
    let best = predictions
        .into_iter()
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .ok_or(InferenceError::Empty)?;

    if !(0.0..=1.0).contains(&best.score) {
        return Err(InferenceError::ScoreOutOfRange(best.score));
    }
    Ok(best)
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference engine error: {0}")]
    Engine(String),

    #[error("Inference engine returned no predictions")]
    Empty,

    #[error("Inference engine returned score {0} outside [0, 1]")]
    ScoreOutOfRange(f64),

    #[error("Inference timed out after {0:?}")]
    Timeout(std::time::Duration),
}
