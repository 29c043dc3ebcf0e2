use std::str::FromStr;

use async_trait::async_trait;
use garde::Validate;
use image::ImageFormat;

use crate::db::queries::{Page, Transition};
use crate::db::{StoreError, StoreManager};
use crate::models::api::{
    Direction, ListParams, ListResponse, RequestView, ResultsQuery, SortField, SortOrder, DEFAULT_PAGE_LIMIT,
};
use crate::models::job::{ClassificationRequest, JobMessage};
use crate::routes::error::ApiError;
use crate::services::queue::{BrokerError, BrokerManager};

/// The slice of the request store the API reads and writes.
#[async_trait]
pub trait RequestLedger: Send + Sync {
    async fn insert_pending(&self) -> Result<ClassificationRequest, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<ClassificationRequest>, StoreError>;

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<Transition, StoreError>;

    async fn list(&self, params: &ListParams) -> Result<Page, StoreError>;
}

#[async_trait]
impl RequestLedger for StoreManager {
    async fn insert_pending(&self) -> Result<ClassificationRequest, StoreError> {
        StoreManager::insert_pending(self).await
    }

    async fn get(&self, id: i64) -> Result<Option<ClassificationRequest>, StoreError> {
        StoreManager::get(self, id).await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<Transition, StoreError> {
        StoreManager::mark_failed(self, id, reason).await
    }

    async fn list(&self, params: &ListParams) -> Result<Page, StoreError> {
        StoreManager::list(self, params).await
    }
}

/// Where accepted jobs are sent.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> Result<(), BrokerError>;
}

#[async_trait]
impl JobPublisher for BrokerManager {
    async fn publish(&self, message: &JobMessage) -> Result<(), BrokerError> {
        BrokerManager::publish(self, message).await
    }
}

const ACCEPTED_FORMATS: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP];

/// Check that the upload is a decodable PNG, JPEG or WebP image.
pub fn validate_image(bytes: &[u8]) -> Result<ImageFormat, ApiError> {
    if bytes.is_empty() {
        return Err(invalid_image("empty upload"));
    }

    let format = image::guess_format(bytes).map_err(|e| invalid_image(e.to_string()))?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(invalid_image(format!("unsupported format {format:?}")));
    }

    image::load_from_memory_with_format(bytes, format).map_err(|e| invalid_image(e.to_string()))?;
    Ok(format)
}

fn invalid_image(error: impl Into<String>) -> ApiError {
    ApiError::ClientInput {
        msg: "Invalid image data".to_string(),
        hint: Some("The image must be a PNG, JPEG or WebP file".to_string()),
        error: Some(error.into()),
    }
}

/// Persist a PENDING row, then publish the job. If the publish fails the
/// row is closed out as FAILED so it never sits pending forever.
pub async fn submit(
    store: &dyn RequestLedger,
    broker: &dyn JobPublisher,
    image: &[u8],
    filename: Option<&str>,
) -> Result<i64, ApiError> {
    let format = validate_image(image).inspect_err(|_| {
        tracing::info!(filename, size = image.len(), "Rejected upload that is not a supported image");
    })?;

    let request = store.insert_pending().await?;
    let id = request.id;

    if let Err(e) = broker.publish(&JobMessage::new(id, image)).await {
        tracing::error!(request_id = id, error = %e, "Failed to publish job, marking request failed");
        metrics::counter!("classification_publish_failures_total").increment(1);

        match store.mark_failed(id, &format!("publish failed: {e}")).await {
            Ok(Transition::Applied) => {}
            Ok(other) => tracing::warn!(request_id = id, ?other, "Unexpected state closing out unpublished request"),
            Err(store_err) => {
                tracing::error!(request_id = id, error = %store_err, "Failed to mark unpublished request failed");
                metrics::counter!("classification_orphaned_requests_total").increment(1);
            }
        }
        return Err(e.into());
    }

    metrics::counter!("classification_requests_total", "format" => format!("{format:?}").to_lowercase())
        .increment(1);
    tracing::info!(request_id = id, filename, size = image.len(), "Classification request queued");
    Ok(id)
}

pub async fn lookup(store: &dyn RequestLedger, id: i64) -> Result<RequestView, ApiError> {
    store
        .get(id)
        .await?
        .map(RequestView::from)
        .ok_or(ApiError::NotFound(id))
}

/// Turn the raw query into listing parameters, rejecting bad values with a hint.
pub fn list_params(query: &ResultsQuery) -> Result<ListParams, ApiError> {
    query
        .validate()
        .map_err(|e| ApiError::client(format!("Invalid query parameters: {e}"), Some("limit must be between 1 and 100")))?;

    Ok(ListParams {
        cursor: query.cursor,
        limit: query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        sort_by: parse_choice::<SortField>("sort_by", query.sort_by.as_deref(), "id, status or label")?,
        order: parse_choice::<SortOrder>("order", query.order.as_deref(), "asc or desc")?,
        direction: parse_choice::<Direction>("direction", query.direction.as_deref(), "next or prev")?,
    })
}

fn parse_choice<T>(name: &str, raw: Option<&str>, allowed: &str) -> Result<T, ApiError>
where
    T: FromStr + Default,
{
    match raw {
        None => Ok(T::default()),
        Some(value) => T::from_str(&value.to_ascii_lowercase()).map_err(|_| {
            ApiError::client(
                format!("Invalid {name}: {value}"),
                Some(&format!("{name} must be one of {allowed}")),
            )
        }),
    }
}

/// One page of results. Sorting by status or label pages from the cursor
/// row's own key, so that row has to exist; a stale cursor is rejected
/// rather than silently answered with an empty page.
pub async fn list(store: &dyn RequestLedger, params: ListParams) -> Result<ListResponse, ApiError> {
    if let Some(cursor) = params.cursor.filter(|_| params.sort_by != SortField::Id) {
        if store.get(cursor).await?.is_none() {
            return Err(ApiError::client(
                format!("Unknown cursor: {cursor}"),
                Some("When sorting by status or label, cursor must be the id of an existing request"),
            ));
        }
    }

    let page = store.list(&params).await?;
    Ok(ListResponse {
        data: page.rows.into_iter().map(RequestView::from).collect(),
        limit: params.limit,
        sort_by: params.sort_by,
        order: params.order,
        cursor: page.cursor,
        has_more: page.has_more,
    })
}
