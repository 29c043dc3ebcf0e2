use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

pub const REQUEST_LATENCY: &str = "request_latency_seconds";
pub const REQUEST_COUNT: &str = "request_count";

/// Records `request_latency_seconds{method, endpoint}` and
/// `request_count{method, endpoint, http_status}` for every routed request.
/// The autoscaler reads the `/predict` latency series.
pub async fn track_latency(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let start = Instant::now();
    let response = next.run(request).await;

    record_request(method, endpoint, response.status(), start.elapsed());
    response
}

fn record_request(method: String, endpoint: String, status: StatusCode, elapsed: Duration) {
    metrics::counter!(
        REQUEST_COUNT,
        "method" => method.clone(),
        "endpoint" => endpoint.clone(),
        "http_status" => status.as_u16().to_string()
    )
    .increment(1);

    metrics::histogram!(
        REQUEST_LATENCY,
        "method" => method,
        "endpoint" => endpoint
    )
    .record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
    use std::sync::{Arc, Mutex};

    type Increments = Arc<Mutex<Vec<(String, Vec<(String, String)>, u64)>>>;

    /// Keeps every counter increment with its name and labels.
    #[derive(Default)]
    struct CapturingRecorder {
        increments: Increments,
    }

    struct CapturedCounter {
        key: Key,
        sink: Increments,
    }

    impl CounterFn for CapturedCounter {
        fn increment(&self, value: u64) {
            let labels = self
                .key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect();
            self.sink
                .lock()
                .unwrap()
                .push((self.key.name().to_string(), labels, value));
        }

        fn absolute(&self, _value: u64) {}
    }

    impl Recorder for CapturingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(Arc::new(CapturedCounter {
                key: key.clone(),
                sink: Arc::clone(&self.increments),
            }))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_request_count_carries_status() {
        let recorder = CapturingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            record_request("POST".into(), "/predict".into(), StatusCode::OK, Duration::from_millis(20));
            record_request("GET".into(), "/predict".into(), StatusCode::NOT_FOUND, Duration::from_millis(3));
        });

        let increments = recorder.increments.lock().unwrap();
        assert_eq!(increments.len(), 2);

        let (name, labels, value) = &increments[0];
        assert_eq!(name, REQUEST_COUNT);
        assert_eq!(*value, 1);
        assert!(labels.contains(&("method".to_string(), "POST".to_string())));
        assert!(labels.contains(&("endpoint".to_string(), "/predict".to_string())));
        assert!(labels.contains(&("http_status".to_string(), "200".to_string())));

        assert!(increments[1].1.contains(&("http_status".to_string(), "404".to_string())));
    }
}
