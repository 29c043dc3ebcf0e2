use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle status of a classification request.
///
/// `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// A persisted classification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub id: i64,
    pub status: RequestStatus,
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Broker payload linking a stored request to its image bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub id: i64,
    /// Base64 (standard alphabet) encoded image.
    pub image: String,
}

impl JobMessage {
    pub fn new(id: i64, image_bytes: &[u8]) -> Self {
        Self {
            id,
            image: base64::engine::general_purpose::STANDARD.encode(image_bytes),
        }
    }

    pub fn decode_image(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.image)
    }
}
