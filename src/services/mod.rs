pub mod autoscaler;
pub mod classifier;
pub mod consumer;
pub mod orchestrator;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod telemetry;
