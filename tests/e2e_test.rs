//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL and Redis running
//! 2. API server running (set API_BASE_URL, default http://localhost:5001)
//! 3. Worker process running with a reachable inference engine
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture --test-threads=1

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use image::ImageFormat;

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_health_check() {
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url()))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
}

#[tokio::test]
#[ignore] // Requires running API server and dependencies
async fn test_e2e_ready_reports_dependencies() {
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/ready", base_url()))
        .send()
        .await
        .expect("Readiness check failed")
        .json()
        .await
        .expect("Readiness body was not JSON");

    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["broker"]["status"], "ok");
}

#[tokio::test]
#[ignore] // Requires running API server, worker and inference engine
async fn test_e2e_single_image_classification() {
    let client = reqwest::Client::new();
    let base_url = base_url();
    let fixture = &IMAGE_FIXTURES[0];

    let id = submit_image(&client, &base_url, fixture.name, fixture.mime, fixture.bytes())
        .await
        .expect("Upload failed");

    let view = poll_request(&client, &base_url, id, 120)
        .await
        .expect("Request never finished");

    assert_eq!(view.id, id);
    assert_eq!(view.status, "PROCESSED");
    assert!(view.label.is_some());
    let confidence = view.confidence.expect("Processed request has a confidence");
    assert!((0.0..=1.0).contains(&confidence));
}

#[tokio::test]
#[ignore] // Requires running API server and dependencies
async fn test_e2e_fixture_acceptance() {
    let client = reqwest::Client::new();
    let base_url = base_url();

    for fixture in IMAGE_FIXTURES {
        let response = upload_image(&client, &base_url, fixture.name, fixture.mime, fixture.bytes())
            .await
            .expect("Upload request failed");

        if fixture.accepted {
            assert_eq!(response.status(), reqwest::StatusCode::CREATED, "{} rejected", fixture.name);
        } else {
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{} accepted", fixture.name);
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["msg"], "Invalid image data");
        }
    }
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_missing_image_field() {
    let client = reqwest::Client::new();
    let form = reqwest::multipart::Form::new().text("caption", "no image here");

    let response = client
        .post(format!("{}/predict", base_url()))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["msg"], "Image not found in request");
    assert!(body["hint"].is_string());
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_lookup_errors() {
    let client = reqwest::Client::new();
    let base_url = base_url();

    let missing = client.get(format!("{}/predict", base_url)).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);

    let unknown = client
        .get(format!("{}/results", base_url))
        .query(&[("id", i64::MAX)])
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

    let bad_limit = client
        .get(format!("{}/results", base_url))
        .query(&[("limit", "500")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad_limit.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore] // Requires running API server and dependencies
async fn test_e2e_results_pagination() {
    let client = reqwest::Client::new();
    let base_url = base_url();

    let mut ids = Vec::new();
    for _ in 0..12 {
        let id = submit_image(&client, &base_url, "tile.jpg", "image/jpeg", encode(ImageFormat::Jpeg, 16, 16))
            .await
            .expect("Upload failed");
        ids.push(id);
    }

    let first = list_results(
        &client,
        &base_url,
        &[("cursor", (ids[0] - 1).to_string()), ("limit", "5".to_string())],
    )
    .await
    .expect("First page failed");
    assert_eq!(first.limit, 5);
    assert_eq!(first.sort_by, "id");
    assert_eq!(first.order, "asc");
    assert_eq!(first.data.len(), 5);
    assert!(first.has_more);
    assert_eq!(first.data.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..5].to_vec());

    let cursor = first.cursor.expect("Full page carries a cursor");
    let second = list_results(
        &client,
        &base_url,
        &[("cursor", cursor.to_string()), ("limit", "5".to_string())],
    )
    .await
    .expect("Second page failed");
    assert_eq!(second.data.iter().map(|r| r.id).collect::<Vec<_>>(), ids[5..10].to_vec());

    let back = list_results(
        &client,
        &base_url,
        &[
            ("cursor", second.data[0].id.to_string()),
            ("limit", "5".to_string()),
            ("direction", "prev".to_string()),
        ],
    )
    .await
    .expect("Previous page failed");
    assert_eq!(back.data.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..5].to_vec());
}

#[tokio::test]
#[ignore] // Requires running API server, worker and inference engine
async fn test_e2e_concurrent_submissions() {
    let client = reqwest::Client::new();
    let base_url = base_url();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            let base_url = base_url.clone();
            tokio::spawn(async move {
                let bytes = encode(ImageFormat::Png, 32 + i, 32);
                let id = submit_image(&client, &base_url, "burst.png", "image/png", bytes).await?;
                poll_request(&client, &base_url, id, 180).await
            })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;

    let mut ids = Vec::new();
    for result in results {
        let view = result.expect("Task panicked").expect("Request failed");
        assert_eq!(view.status, "PROCESSED");
        ids.push(view.id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8, "every submission gets its own id");
}
