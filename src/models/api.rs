use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::job::{ClassificationRequest, RequestStatus};

pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Columns a listing may be ordered by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortField {
    #[default]
    Id,
    Status,
    Label,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Which way a cursor window moves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    #[default]
    Next,
    Prev,
}

/// Query string for `GET /predict` and `GET /results`.
///
/// With `id` set it is a point lookup; otherwise a cursor listing. Sort
/// parameters arrive as raw strings so unknown values surface as a client
/// error with a hint instead of a bare extractor rejection.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ResultsQuery {
    #[garde(skip)]
    pub id: Option<i64>,

    #[garde(skip)]
    pub cursor: Option<i64>,

    #[garde(range(min = 1, max = MAX_PAGE_LIMIT))]
    pub limit: Option<i64>,

    #[garde(skip)]
    pub sort_by: Option<String>,

    #[garde(skip)]
    pub order: Option<String>,

    #[garde(skip)]
    pub direction: Option<String>,
}

/// Validated listing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListParams {
    pub cursor: Option<i64>,
    pub limit: i64,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub direction: Direction,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_LIMIT,
            sort_by: SortField::default(),
            order: SortOrder::default(),
            direction: Direction::default(),
        }
    }
}

/// Response after submitting an image.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: i64,
}

/// Public view of one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestView {
    pub id: i64,
    pub status: RequestStatus,
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl From<ClassificationRequest> for RequestView {
    fn from(request: ClassificationRequest) -> Self {
        Self {
            id: request.id,
            status: request.status,
            label: request.label,
            confidence: request.confidence,
        }
    }
}

/// One page of a cursor listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub data: Vec<RequestView>,
    pub limit: i64,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub cursor: Option<i64>,
    pub has_more: bool,
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
