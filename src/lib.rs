//! Queued image classification pipeline.
//!
//! An HTTP producer persists classification requests to PostgreSQL and
//! publishes them to a Redis-backed queue; workers consume the queue, call
//! an external inference engine and record the top label; an autoscaler
//! resizes the worker deployment from Prometheus latency and traffic data.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
