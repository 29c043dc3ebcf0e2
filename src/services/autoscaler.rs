use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::AutoscalerConfig;
use crate::services::orchestrator::{ReplicaController, ScaleError};
use crate::services::telemetry::{latency_query, request_rate_query, TelemetrySource};

/// Thresholds and bounds for one deployment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub latency_threshold_up: f64,
    pub latency_threshold_down: f64,
    pub count_threshold: f64,
    pub min_replicas: i32,
    pub max_replicas: i32,
}

impl From<&AutoscalerConfig> for ScalingPolicy {
    fn from(config: &AutoscalerConfig) -> Self {
        Self {
            latency_threshold_up: config.latency_threshold_up,
            latency_threshold_down: config.latency_threshold_down,
            count_threshold: config.count_threshold,
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas,
        }
    }
}

/// One successful telemetry read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Seconds.
    pub latency: f64,
    /// Requests per minute.
    pub request_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Up(i32),
    Down(i32),
    Hold,
}

/// Hysteresis rule. Pressure (latency above the upper threshold or request
/// rate above the count threshold) grows the fleet by one; latency below the
/// lower threshold shrinks it by one; anything in between holds. Pressure
/// always wins over a low latency reading. A step is only taken when it lands
/// inside the configured bounds, so a fleet below the minimum can still grow
/// into range but is never shrunk further.
pub fn decide(policy: &ScalingPolicy, current: i32, observation: &Observation) -> ScalingDecision {
    let bounds = policy.min_replicas..=policy.max_replicas;
    let under_pressure = observation.latency > policy.latency_threshold_up
        || observation.request_rate > policy.count_threshold;

    if under_pressure {
        let to = current.saturating_add(1);
        if bounds.contains(&to) {
            ScalingDecision::Up(to)
        } else {
            ScalingDecision::Hold
        }
    } else if observation.latency < policy.latency_threshold_down {
        let to = current.saturating_sub(1);
        if bounds.contains(&to) {
            ScalingDecision::Down(to)
        } else {
            ScalingDecision::Hold
        }
    } else {
        ScalingDecision::Hold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
    Pressure,
    Idle,
    /// Telemetry has been unavailable for too long.
    Failsafe,
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Scaled { from: i32, to: i32, reason: ScaleReason },
    Held { replicas: i32 },
    MetricsUnavailable { failure_count: u32 },
}

/// Telemetry-driven replica control loop for one deployment.
///
/// States: healthy, degraded (consecutive telemetry failures counted up to
/// `max_failures`), and fail-safe pending (one forced scale-up owed). Not
/// re-entrant; run one instance per deployment.
pub struct AutoScaler {
    telemetry: Arc<dyn TelemetrySource>,
    controller: Arc<dyn ReplicaController>,
    policy: ScalingPolicy,
    deployment: String,
    moving_average_duration: String,
    cooldown: Duration,
    max_failures: u32,
    failure_count: u32,
    failure_upscale: bool,
}

impl AutoScaler {
    pub fn new(
        config: &AutoscalerConfig,
        telemetry: Arc<dyn TelemetrySource>,
        controller: Arc<dyn ReplicaController>,
    ) -> Self {
        Self {
            telemetry,
            controller,
            policy: ScalingPolicy::from(config),
            deployment: config.deployment_name.clone(),
            moving_average_duration: config.moving_average_duration.clone(),
            cooldown: config.cooldown(),
            max_failures: config.max_failures,
            failure_count: 0,
            failure_upscale: false,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn failsafe_pending(&self) -> bool {
        self.failure_upscale
    }

    /// Run forever, one iteration per cooldown period.
    pub async fn run(mut self) {
        tracing::info!(
            deployment = %self.deployment,
            cooldown_secs = self.cooldown.as_secs(),
            min_replicas = self.policy.min_replicas,
            max_replicas = self.policy.max_replicas,
            "Starting autoscaler loop"
        );

        loop {
            match self.tick().await {
                Ok(outcome) => tracing::debug!(?outcome, "Autoscaler iteration finished"),
                Err(e) => tracing::error!(error = %e, "Error reading or scaling deployment"),
            }
            sleep(self.cooldown).await;
        }
    }

    async fn observe(&self) -> Option<Observation> {
        let latency = match self.telemetry.query(&latency_query(&self.moving_average_duration)).await {
            Ok(Some(v)) => Some(v),
            Ok(None) => {
                tracing::error!("Failed to retrieve moving average latency");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Error querying moving average latency");
                None
            }
        };

        let request_rate = match self.telemetry.query(&request_rate_query()).await {
            Ok(Some(v)) => Some(v),
            Ok(None) => {
                tracing::error!("Failed to retrieve request rate for /predict");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Error querying request rate");
                None
            }
        };

        Some(Observation {
            latency: latency?,
            request_rate: request_rate?,
        })
    }

    /// One iteration, without the cooldown sleep.
    pub async fn tick(&mut self) -> Result<TickOutcome, ScaleError> {
        let Some(observation) = self.observe().await else {
            self.failure_count += 1;
            metrics::counter!("autoscaler_metric_failures_total").increment(1);
            if self.failure_count > self.max_failures {
                tracing::warn!(
                    failures = self.failure_count,
                    "Telemetry unavailable for too long, scheduling fail-safe scale-up"
                );
                self.failure_upscale = true;
                self.failure_count = 0;
            }

            if self.failure_upscale {
                return self.failsafe_upscale().await;
            }
            return Ok(TickOutcome::MetricsUnavailable {
                failure_count: self.failure_count,
            });
        };

        self.failure_count = 0;
        if self.failure_upscale {
            return self.failsafe_upscale().await;
        }

        let current = self.current_replicas().await?;
        tracing::info!(
            latency_secs = observation.latency,
            request_rate = observation.request_rate,
            replicas = current,
            "Current deployment telemetry"
        );

        match decide(&self.policy, current, &observation) {
            ScalingDecision::Up(to) => self.scale(current, to, ScaleReason::Pressure).await,
            ScalingDecision::Down(to) => self.scale(current, to, ScaleReason::Idle).await,
            ScalingDecision::Hold => Ok(TickOutcome::Held { replicas: current }),
        }
    }

    /// Force one step up; the flag is only cleared once that is settled.
    async fn failsafe_upscale(&mut self) -> Result<TickOutcome, ScaleError> {
        let current = self.current_replicas().await?;
        let outcome = if current < self.policy.max_replicas {
            self.scale(current, current + 1, ScaleReason::Failsafe).await?
        } else {
            TickOutcome::Held { replicas: current }
        };
        self.failure_upscale = false;
        Ok(outcome)
    }

    async fn current_replicas(&self) -> Result<i32, ScaleError> {
        let replicas = self.controller.replicas(&self.deployment).await?;
        metrics::gauge!("autoscaler_replicas", "deployment" => self.deployment.clone()).set(replicas as f64);
        Ok(replicas)
    }

    async fn scale(&self, from: i32, to: i32, reason: ScaleReason) -> Result<TickOutcome, ScaleError> {
        tracing::info!(deployment = %self.deployment, from, to, ?reason, "Scaling deployment");
        self.controller.set_replicas(&self.deployment, to).await?;

        let direction = if to > from { "up" } else { "down" };
        metrics::counter!("autoscaler_scale_actions_total", "direction" => direction).increment(1);
        metrics::gauge!("autoscaler_replicas", "deployment" => self.deployment.clone()).set(to as f64);
        Ok(TickOutcome::Scaled { from, to, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::telemetry::TelemetryError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            latency_threshold_up: 0.5,
            latency_threshold_down: 0.1,
            count_threshold: 100.0,
            min_replicas: 1,
            max_replicas: 10,
        }
    }

    fn obs(latency: f64, request_rate: f64) -> Observation {
        Observation {
            latency,
            request_rate,
        }
    }

    #[test]
    fn test_latency_between_thresholds_holds() {
        assert_eq!(decide(&policy(), 5, &obs(0.3, 10.0)), ScalingDecision::Hold);
    }

    #[test]
    fn test_request_rate_above_threshold_scales_up() {
        assert_eq!(decide(&policy(), 3, &obs(0.3, 150.0)), ScalingDecision::Up(4));
    }

    #[test]
    fn test_high_latency_scales_up_and_low_latency_scales_down() {
        assert_eq!(decide(&policy(), 3, &obs(0.8, 0.0)), ScalingDecision::Up(4));
        assert_eq!(decide(&policy(), 3, &obs(0.05, 0.0)), ScalingDecision::Down(2));
    }

    #[test]
    fn test_bounds_are_respected() {
        assert_eq!(decide(&policy(), 10, &obs(0.8, 500.0)), ScalingDecision::Hold);
        assert_eq!(decide(&policy(), 1, &obs(0.01, 0.0)), ScalingDecision::Hold);
    }

    #[test]
    fn test_pressure_grows_fleet_below_minimum() {
        assert_eq!(decide(&policy(), 0, &obs(2.0, 500.0)), ScalingDecision::Up(1));

        let p = ScalingPolicy {
            min_replicas: 3,
            ..policy()
        };
        // One step short of the minimum is still outside the range
        assert_eq!(decide(&p, 1, &obs(2.0, 0.0)), ScalingDecision::Hold);
        assert_eq!(decide(&p, 2, &obs(2.0, 0.0)), ScalingDecision::Up(3));
        assert_eq!(decide(&p, 2, &obs(0.01, 0.0)), ScalingDecision::Hold);
    }

    #[test]
    fn test_idle_fleet_above_maximum_steps_down_into_range() {
        assert_eq!(decide(&policy(), 11, &obs(0.01, 0.0)), ScalingDecision::Down(10));
        assert_eq!(decide(&policy(), 13, &obs(0.01, 0.0)), ScalingDecision::Hold);
        assert_eq!(decide(&policy(), 11, &obs(0.8, 0.0)), ScalingDecision::Hold);
    }

    #[test]
    fn test_pressure_wins_over_low_latency() {
        // Fast responses but a flood of requests: never shrink.
        assert_eq!(decide(&policy(), 10, &obs(0.01, 500.0)), ScalingDecision::Hold);
        assert_eq!(decide(&policy(), 4, &obs(0.01, 500.0)), ScalingDecision::Up(5));
    }

    #[test]
    fn test_decisions_stay_in_bounds_and_move_by_one() {
        let p = policy();
        for current in -2..=14 {
            for latency in [0.0, 0.05, 0.1, 0.3, 0.5, 0.9] {
                for rate in [0.0, 100.0, 101.0] {
                    match decide(&p, current, &obs(latency, rate)) {
                        ScalingDecision::Up(to) | ScalingDecision::Down(to) => {
                            assert!((p.min_replicas..=p.max_replicas).contains(&to));
                            assert_eq!((to - current).abs(), 1);
                        }
                        ScalingDecision::Hold => {}
                    }
                }
            }
        }
    }

    struct FakeTelemetry {
        latency: Mutex<Option<f64>>,
        rate: Mutex<Option<f64>>,
    }

    impl FakeTelemetry {
        fn new(latency: Option<f64>, rate: Option<f64>) -> Self {
            Self {
                latency: Mutex::new(latency),
                rate: Mutex::new(rate),
            }
        }

        fn set(&self, latency: Option<f64>, rate: Option<f64>) {
            *self.latency.lock().unwrap() = latency;
            *self.rate.lock().unwrap() = rate;
        }
    }

    #[async_trait]
    impl TelemetrySource for FakeTelemetry {
        async fn query(&self, expression: &str) -> Result<Option<f64>, TelemetryError> {
            let value = if expression.contains("max_over_time") {
                *self.latency.lock().unwrap()
            } else {
                *self.rate.lock().unwrap()
            };
            value
                .map(Some)
                .ok_or_else(|| TelemetryError::Backend("connection refused".to_string()))
        }
    }

    struct FakeController {
        replicas: Mutex<i32>,
        calls: Mutex<Vec<i32>>,
    }

    impl FakeController {
        fn new(replicas: i32) -> Self {
            Self {
                replicas: Mutex::new(replicas),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<i32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplicaController for FakeController {
        async fn replicas(&self, _deployment: &str) -> Result<i32, ScaleError> {
            Ok(*self.replicas.lock().unwrap())
        }

        async fn set_replicas(&self, _deployment: &str, replicas: i32) -> Result<(), ScaleError> {
            *self.replicas.lock().unwrap() = replicas;
            self.calls.lock().unwrap().push(replicas);
            Ok(())
        }
    }

    fn config(max_failures: u32) -> AutoscalerConfig {
        let mut config: AutoscalerConfig = envy::from_iter(vec![
            ("PROMETHEUS_URL".to_string(), "http://prometheus:9090".to_string()),
            ("DEPLOYMENT_NAME".to_string(), "worker".to_string()),
            ("LATENCY_THRESHOLD_UP".to_string(), "0.5".to_string()),
            ("LATENCY_THRESHOLD_DOWN".to_string(), "0.1".to_string()),
            ("COUNT_THRESHOLD".to_string(), "100".to_string()),
            ("MAX_REPLICAS".to_string(), "10".to_string()),
        ])
        .unwrap();
        config.max_failures = max_failures;
        config
    }

    fn scaler(
        telemetry: &Arc<FakeTelemetry>,
        controller: &Arc<FakeController>,
        max_failures: u32,
    ) -> AutoScaler {
        AutoScaler::new(&config(max_failures), telemetry.clone(), controller.clone())
    }

    #[tokio::test]
    async fn test_scale_up_on_request_rate() {
        let telemetry = Arc::new(FakeTelemetry::new(Some(0.3), Some(150.0)));
        let controller = Arc::new(FakeController::new(3));
        let mut autoscaler = scaler(&telemetry, &controller, 3);

        let outcome = autoscaler.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Scaled {
                from: 3,
                to: 4,
                reason: ScaleReason::Pressure
            }
        );
        assert_eq!(controller.calls(), vec![4]);
    }

    #[tokio::test]
    async fn test_hysteresis_band_makes_no_call() {
        let telemetry = Arc::new(FakeTelemetry::new(Some(0.3), Some(10.0)));
        let controller = Arc::new(FakeController::new(5));
        let mut autoscaler = scaler(&telemetry, &controller, 3);

        assert_eq!(autoscaler.tick().await.unwrap(), TickOutcome::Held { replicas: 5 });
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failsafe_after_consecutive_failures() {
        let telemetry = Arc::new(FakeTelemetry::new(None, Some(10.0)));
        let controller = Arc::new(FakeController::new(3));
        let mut autoscaler = scaler(&telemetry, &controller, 3);

        for expected in 1..=3 {
            assert_eq!(
                autoscaler.tick().await.unwrap(),
                TickOutcome::MetricsUnavailable {
                    failure_count: expected
                }
            );
        }
        assert!(controller.calls().is_empty());

        assert_eq!(
            autoscaler.tick().await.unwrap(),
            TickOutcome::Scaled {
                from: 3,
                to: 4,
                reason: ScaleReason::Failsafe
            }
        );
        assert!(!autoscaler.failsafe_pending());
        assert_eq!(autoscaler.failure_count(), 0);

        // The counter starts over; no second forced step.
        assert_eq!(
            autoscaler.tick().await.unwrap(),
            TickOutcome::MetricsUnavailable { failure_count: 1 }
        );
        assert_eq!(controller.calls(), vec![4]);
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_count() {
        let telemetry = Arc::new(FakeTelemetry::new(None, None));
        let controller = Arc::new(FakeController::new(3));
        let mut autoscaler = scaler(&telemetry, &controller, 3);

        autoscaler.tick().await.unwrap();
        autoscaler.tick().await.unwrap();
        assert_eq!(autoscaler.failure_count(), 2);

        telemetry.set(Some(0.3), Some(10.0));
        autoscaler.tick().await.unwrap();
        assert_eq!(autoscaler.failure_count(), 0);

        telemetry.set(None, None);
        for _ in 0..3 {
            autoscaler.tick().await.unwrap();
        }
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failsafe_at_max_replicas_clears_without_scaling() {
        let telemetry = Arc::new(FakeTelemetry::new(None, None));
        let controller = Arc::new(FakeController::new(10));
        let mut autoscaler = scaler(&telemetry, &controller, 0);

        assert_eq!(autoscaler.tick().await.unwrap(), TickOutcome::Held { replicas: 10 });
        assert!(!autoscaler.failsafe_pending());
        assert!(controller.calls().is_empty());
    }
}
