use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub version: String,
    pub checks: ReadinessChecks,
}

#[derive(Serialize)]
pub struct ReadinessChecks {
    pub database: ComponentHealth,
    pub broker: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_result<E>(result: Result<(), E>, start: std::time::Instant) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(_) => Self {
                status: "error".to_string(),
                latency_ms: None,
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: process liveness, independent of dependencies.
pub async fn health_check() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ready: store and broker reachability.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let db_start = std::time::Instant::now();
    let database = ComponentHealth::from_result(state.store.ping().await, db_start);

    let broker_start = std::time::Instant::now();
    let broker = ComponentHealth::from_result(state.broker.health_check().await, broker_start);

    let all_healthy = database.is_ok() && broker.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = ReadinessResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: ReadinessChecks { database, broker },
    };

    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_is_always_ok() {
        let Json(body) = health_check().await;
        assert_eq!(body.status, "ok");
    }

    #[test]
    fn test_component_health_from_result() {
        let ok = ComponentHealth::from_result::<()>(Ok(()), std::time::Instant::now());
        assert!(ok.is_ok());
        assert!(ok.latency_ms.is_some());

        let err = ComponentHealth::from_result(Err("down"), std::time::Instant::now());
        assert!(!err.is_ok());
        assert!(err.latency_ms.is_none());
    }
}
