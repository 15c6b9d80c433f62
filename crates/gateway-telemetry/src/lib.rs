//! # Gateway Telemetry
//!
//! Observability for the relay gateway.
//!
//! This crate provides:
//! - Structured logging with optional OpenTelemetry tracing
//! - Prometheus relay metrics
//! - First-byte latency tracking

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod latency;
pub mod metrics;
pub mod tracing_setup;

// Re-export main types
pub use latency::{LatencyMonitor, LatencyStats, LatencySweepJob};
pub use metrics::{RelayMetrics, RequestOutcome};
pub use tracing_setup::{init_tracing, shutdown_tracing, TracingError};
