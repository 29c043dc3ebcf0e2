use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::ResultsQuery;
use crate::routes::error::ApiError;
use crate::routes::predict::query_error;
use crate::services::producer;

/// GET /results: one request by `id`, or a cursor-paginated listing.
pub async fn get_results(
    State(state): State<AppState>,
    query: Result<Query<ResultsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(query_error)?;

    if let Some(id) = query.id {
        let view = producer::lookup(state.store.as_ref(), id).await?;
        return Ok(Json(view).into_response());
    }

    let params = producer::list_params(&query)?;
    let page = producer::list(state.store.as_ref(), params).await?;
    Ok(Json(page).into_response())
}
