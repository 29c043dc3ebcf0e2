use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::api::{RequestView, SubmitResponse};
use crate::routes::error::ApiError;
use crate::services::producer;

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<i64>,
}

/// POST /predict: upload an image for classification.
pub async fn submit_prediction(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut image_data = None;
    let mut filename = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("image") {
            filename = field.file_name().map(str::to_string);
            image_data = Some(field.bytes().await.map_err(multipart_error)?);
        }
    }

    let image_data = image_data.ok_or_else(|| {
        ApiError::client(
            "Image not found in request",
            Some("Add the image to a key named \"image\""),
        )
    })?;

    let id = producer::submit(
        state.store.as_ref(),
        state.broker.as_ref(),
        &image_data,
        filename.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

/// GET /predict?id=: status of one request.
pub async fn get_prediction(
    State(state): State<AppState>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Result<Json<RequestView>, ApiError> {
    let Query(query) = query.map_err(query_error)?;
    let id = query.id.ok_or_else(missing_id)?;
    Ok(Json(producer::lookup(state.store.as_ref(), id).await?))
}

pub(crate) fn missing_id() -> ApiError {
    ApiError::client(
        "Request ID not found in query parameters",
        Some("Add the request ID to the query parameter \"id\""),
    )
}

pub(crate) fn query_error(rejection: QueryRejection) -> ApiError {
    ApiError::ClientInput {
        msg: "Invalid query parameters".to_string(),
        hint: None,
        error: Some(rejection.body_text()),
    }
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::ClientInput {
        msg: "Malformed multipart upload".to_string(),
        hint: Some("Send the image as multipart/form-data".to_string()),
        error: Some(e.body_text()),
    }
}
