//! Prometheus relay metrics.
//!
//! Metrics live in their own [`Registry`] owned by the process state, so each
//! test can build a fresh instance.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Outcome label of a relay attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Upstream answered and quota was settled
    Success,
    /// Rejected before dispatch
    Rejected,
    /// Upstream or stream failure
    Failed,
}

impl RequestOutcome {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Relay metrics
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    quota_settled_total: IntCounter,
    quota_refunded_total: IntCounter,
    first_byte_seconds: Histogram,
    stream_end_total: IntCounterVec,
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics").finish_non_exhaustive()
    }
}

impl RelayMetrics {
    /// Create and register all relay metrics
    ///
    /// # Errors
    /// Returns error if a metric cannot be registered
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("relay_requests_total", "Relay attempts by channel, model and outcome"),
            &["channel", "model", "outcome"],
        )?;
        let quota_settled_total = IntCounter::with_opts(Opts::new(
            "relay_quota_settled_total",
            "Reservations settled against reported usage",
        ))?;
        let quota_refunded_total = IntCounter::with_opts(Opts::new(
            "relay_quota_refunded_total",
            "Reservations refunded in full",
        ))?;
        let first_byte_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "relay_first_byte_seconds",
                "Time from request entry to the first accepted upstream frame",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;
        let stream_end_total = IntCounterVec::new(
            Opts::new("relay_stream_end_total", "Streams by terminal state"),
            &["state"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(quota_settled_total.clone()))?;
        registry.register(Box::new(quota_refunded_total.clone()))?;
        registry.register(Box::new(first_byte_seconds.clone()))?;
        registry.register(Box::new(stream_end_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            quota_settled_total,
            quota_refunded_total,
            first_byte_seconds,
            stream_end_total,
        })
    }

    /// Count one relay attempt
    pub fn record_request(&self, channel_id: i64, model: &str, outcome: RequestOutcome) {
        self.requests_total
            .with_label_values(&[&channel_id.to_string(), model, outcome.as_str()])
            .inc();
    }

    /// Count one settlement
    pub fn record_settled(&self) {
        self.quota_settled_total.inc();
    }

    /// Count one refund
    pub fn record_refunded(&self) {
        self.quota_refunded_total.inc();
    }

    /// Observe first-byte latency
    pub fn record_first_byte(&self, latency: Duration) {
        self.first_byte_seconds.observe(latency.as_secs_f64());
    }

    /// Count a stream ending in `state`
    pub fn record_stream_end(&self, state: &str) {
        self.stream_end_total.with_label_values(&[state]).inc();
    }

    /// Render every metric in the text exposition format
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Underlying registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
