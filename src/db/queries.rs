use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::api::{Direction, ListParams, SortField, SortOrder};
use crate::models::job::{ClassificationRequest, RequestStatus};

const COLUMNS: &str = "id, status, label, confidence, error, created_at, updated_at";

/// Outcome of a guarded status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The row had already left PENDING; nothing was written.
    AlreadyFinal(RequestStatus),
    /// No row with that id exists.
    Missing,
}

/// One window of a cursor listing, already in the requested order.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<ClassificationRequest>,
    pub has_more: bool,
    pub cursor: Option<i64>,
}

fn request_from_row(row: &PgRow) -> Result<ClassificationRequest, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = RequestStatus::from_str(&status).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;

    Ok(ClassificationRequest {
        id: row.try_get("id")?,
        status,
        label: row.try_get("label")?,
        confidence: row.try_get("confidence")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new request in PENDING state. The store assigns the id.
pub async fn insert_pending(pool: &PgPool) -> Result<ClassificationRequest, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO classification_requests (status) VALUES ($1) RETURNING {COLUMNS}"
    ))
    .bind(RequestStatus::Pending.to_string())
    .fetch_one(pool)
    .await?;

    request_from_row(&row)
}

/// Get a request by id
pub async fn get_request(
    pool: &PgPool,
    id: i64,
) -> Result<Option<ClassificationRequest>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM classification_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(request_from_row).transpose()
}

/// PENDING → PROCESSED with the winning label.
pub async fn mark_processed(
    pool: &PgPool,
    id: i64,
    label: &str,
    confidence: f64,
) -> Result<Transition, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE classification_requests
        SET status = $2, label = $3, confidence = $4, updated_at = NOW()
        WHERE id = $1 AND status = $5
        "#,
    )
    .bind(id)
    .bind(RequestStatus::Processed.to_string())
    .bind(label)
    .bind(confidence)
    .bind(RequestStatus::Pending.to_string())
    .execute(pool)
    .await?
    .rows_affected();

    resolve_transition(pool, id, updated).await
}

/// PENDING → FAILED, recording why.
pub async fn mark_failed(pool: &PgPool, id: i64, reason: &str) -> Result<Transition, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE classification_requests
        SET status = $2, error = $3, updated_at = NOW()
        WHERE id = $1 AND status = $4
        "#,
    )
    .bind(id)
    .bind(RequestStatus::Failed.to_string())
    .bind(reason)
    .bind(RequestStatus::Pending.to_string())
    .execute(pool)
    .await?
    .rows_affected();

    resolve_transition(pool, id, updated).await
}

async fn resolve_transition(
    pool: &PgPool,
    id: i64,
    rows_affected: u64,
) -> Result<Transition, sqlx::Error> {
    if rows_affected > 0 {
        return Ok(Transition::Applied);
    }

    Ok(match get_request(pool, id).await? {
        Some(existing) => Transition::AlreadyFinal(existing.status),
        None => Transition::Missing,
    })
}

/// Sort key expression for a column. NULL labels sort as the empty string
/// so row comparisons against the cursor stay total.
fn sort_key(field: SortField) -> &'static str {
    match field {
        SortField::Id => "id",
        SortField::Status => "status",
        SortField::Label => "COALESCE(label, '')",
    }
}

/// Whether rows are scanned in ascending order for this window.
fn scans_ascending(params: &ListParams) -> bool {
    (params.order == SortOrder::Asc) == (params.direction == Direction::Next)
}

/// Keyset query for one window. Fetches `limit + 1` rows so the caller can
/// tell whether more remain. Placeholders: `$1` cursor (if any), then limit.
pub fn list_sql(params: &ListParams) -> String {
    let key = sort_key(params.sort_by);
    let ascending = scans_ascending(params);
    let (cmp, dir) = if ascending { (">", "ASC") } else { ("<", "DESC") };

    let (filter, limit_placeholder) = match (params.cursor, params.sort_by) {
        (None, _) => (String::new(), "$1"),
        (Some(_), SortField::Id) => (format!("WHERE id {cmp} $1 "), "$2"),
        (Some(_), _) => (
            format!(
                "WHERE ({key}, id) {cmp} (SELECT {key}, id FROM classification_requests WHERE id = $1) "
            ),
            "$2",
        ),
    };

    let order_by = if params.sort_by == SortField::Id {
        format!("id {dir}")
    } else {
        format!("{key} {dir}, id {dir}")
    };

    format!(
        "SELECT {COLUMNS} FROM classification_requests {filter}ORDER BY {order_by} LIMIT {limit_placeholder}"
    )
}

impl Page {
    /// Build a page from the `limit + 1` rows a window query returned in scan order.
    pub fn assemble(mut rows: Vec<ClassificationRequest>, params: &ListParams) -> Self {
        let limit = params.limit.max(1) as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        if params.direction == Direction::Prev {
            rows.reverse();
        }

        let cursor = if rows.len() == limit {
            match params.direction {
                Direction::Next => rows.last().map(|r| r.id),
                Direction::Prev => rows.first().map(|r| r.id),
            }
        } else {
            None
        };

        Self {
            rows,
            has_more,
            cursor,
        }
    }
}

/// Cursor-paginated listing.
pub async fn list_requests(pool: &PgPool, params: &ListParams) -> Result<Page, sqlx::Error> {
    let sql = list_sql(params);
    let mut query = sqlx::query(&sql);
    if let Some(cursor) = params.cursor {
        query = query.bind(cursor);
    }
    let rows = query.bind(params.limit + 1).fetch_all(pool).await?;

    let requests = rows
        .iter()
        .map(request_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page::assemble(requests, params))
}
