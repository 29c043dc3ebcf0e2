//! Test helper utilities for integration and E2E testing

use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

use classifier_pipeline::config::{BrokerConfig, StoreConfig};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Response from POST /predict
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub id: i64,
}

/// Response from GET /predict?id= and GET /results?id=
#[derive(Debug, Deserialize)]
pub struct RequestView {
    pub id: i64,
    pub status: String,
    pub label: Option<String>,
    pub confidence: Option<f64>,
}

/// Response from a GET /results listing
#[derive(Debug, Deserialize)]
pub struct ListResponse {
    pub data: Vec<RequestView>,
    pub limit: i64,
    pub sort_by: String,
    pub order: String,
    pub cursor: Option<i64>,
    pub has_more: bool,
}

/// Base URL of a running API, from `API_BASE_URL`.
pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:5001".to_string())
}

/// Store settings from the `DB_*` environment.
pub fn store_config() -> StoreConfig {
    dotenvy::dotenv().ok();
    envy::prefixed("DB_").from_env().expect("Failed to load DB_* configuration")
}

/// Broker settings from the `BROKER_*` environment, on a queue private to
/// this test.
pub fn broker_config(queue_suffix: &str) -> BrokerConfig {
    dotenvy::dotenv().ok();
    let mut config: BrokerConfig = envy::prefixed("BROKER_")
        .from_env()
        .expect("Failed to load BROKER_* configuration");
    config.queue = format!("test:{}:{}", queue_suffix, uuid::Uuid::new_v4());
    config
}

/// Upload an image to the predict endpoint
pub async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    mime: &str,
    bytes: Vec<u8>,
) -> TestResult<reqwest::Response> {
    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)?,
    );

    Ok(client
        .post(format!("{}/predict", base_url))
        .multipart(form)
        .send()
        .await?)
}

/// Upload an image and return the new request id
pub async fn submit_image(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    mime: &str,
    bytes: Vec<u8>,
) -> TestResult<i64> {
    let response = upload_image(client, base_url, filename, mime, bytes).await?;
    let status = response.status();
    if status != reqwest::StatusCode::CREATED {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }
    Ok(response.json::<SubmitResponse>().await?.id)
}

/// Poll a request until it leaves PENDING (with timeout)
pub async fn poll_request(
    client: &reqwest::Client,
    base_url: &str,
    id: i64,
    timeout_secs: u64,
) -> TestResult<RequestView> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/predict", base_url))
            .query(&[("id", id)])
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let view = response.json::<RequestView>().await?;
        match view.status.as_str() {
            "PROCESSED" | "FAILED" => return Ok(view),
            "PENDING" => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown request status: {}", other).into()),
        }
    }

    Err(format!("Request {} did not finish within {} seconds", id, timeout_secs).into())
}

/// Fetch one listing window
pub async fn list_results(
    client: &reqwest::Client,
    base_url: &str,
    query: &[(&str, String)],
) -> TestResult<ListResponse> {
    let response = client
        .get(format!("{}/results", base_url))
        .query(query)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Listing failed with status {}: {}", status, error_text).into());
    }
    Ok(response.json::<ListResponse>().await?)
}
