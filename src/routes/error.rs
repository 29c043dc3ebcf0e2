use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::db::StoreError;
use crate::models::api::ErrorBody;
use crate::services::queue::BrokerError;

/// Every failure a route can report, mapped to a status code and a
/// `{msg, hint?, error?}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{msg}")]
    ClientInput {
        msg: String,
        hint: Option<String>,
        error: Option<String>,
    },

    #[error("Request ID {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ApiError {
    pub fn client(msg: impl Into<String>, hint: Option<&str>) -> Self {
        Self::ClientInput {
            msg: msg.into(),
            hint: hint.map(str::to_string),
            error: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientInput { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::Connect(_) | StoreError::ConnectExhausted { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Broker(BrokerError::Serialize(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Self::ClientInput { msg, hint, error } => ErrorBody {
                msg: msg.clone(),
                hint: hint.clone(),
                error: error.clone(),
            },
            Self::NotFound(_) => ErrorBody {
                msg: "Request ID not found".to_string(),
                hint: Some("Check the request ID and try again".to_string()),
                error: None,
            },
            Self::Store(e) => ErrorBody {
                msg: "Database error occurred".to_string(),
                hint: None,
                error: Some(e.to_string()),
            },
            Self::Broker(e) => ErrorBody {
                msg: "Failed to publish message to the broker".to_string(),
                hint: None,
                error: Some(e.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, %status, "Request failed");
        } else {
            tracing::debug!(error = %self, %status, "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
