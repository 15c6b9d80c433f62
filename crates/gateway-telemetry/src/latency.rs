//! First-byte latency monitor.
//!
//! Tracks in-flight requests by id and keeps running first-byte statistics.
//! Purely observational; nothing on the settlement path reads it.

use async_trait::async_trait;
use gateway_core::PeriodicJob;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// First-byte latency above this is logged as a warning
pub const SLOW_FIRST_BYTE: Duration = Duration::from_secs(2);

/// In-flight entries older than this are dropped by the sweep
pub const STALE_AFTER: Duration = Duration::from_secs(600);

/// Latency statistics in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    /// Requests that produced a first byte
    pub total_requests: u64,
    /// Average first-byte latency
    pub avg_first_token_latency: u64,
    /// Maximum first-byte latency
    pub max_first_token_latency: u64,
    /// Minimum first-byte latency, 0 before the first sample
    pub min_first_token_latency: u64,
    /// Requests currently tracked
    pub active_requests: usize,
}

#[derive(Debug, Default)]
struct Aggregate {
    count: u64,
    total: Duration,
    max: Duration,
    min: Option<Duration>,
}

impl Aggregate {
    fn observe(&mut self, latency: Duration) {
        self.count += 1;
        self.total += latency;
        self.max = self.max.max(latency);
        self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
    }
}

#[derive(Debug, Default)]
struct Inner {
    active: HashMap<String, Instant>,
    aggregate: Aggregate,
}

/// Per-process first-byte latency tracker
#[derive(Debug, Default)]
pub struct LatencyMonitor {
    inner: Mutex<Inner>,
}

impl LatencyMonitor {
    /// Create an empty monitor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `request_id`
    pub fn start(&self, request_id: &str) {
        self.inner
            .lock()
            .active
            .insert(request_id.to_string(), Instant::now());
    }

    /// Record the first-byte latency of a tracked request.
    ///
    /// Returns `false` when `request_id` is not tracked.
    pub fn record_first_byte(&self, request_id: &str, latency: Duration) -> bool {
        let mut inner = self.inner.lock();
        if !inner.active.contains_key(request_id) {
            return false;
        }
        inner.aggregate.observe(latency);
        drop(inner);

        if latency > SLOW_FIRST_BYTE {
            warn!(
                request_id = %request_id,
                latency_ms = latency.as_millis() as u64,
                "Slow first byte"
            );
        }
        true
    }

    /// Stop tracking `request_id`; returns its total latency if tracked
    pub fn finish(&self, request_id: &str) -> Option<Duration> {
        let started = self.inner.lock().active.remove(request_id)?;
        let total = started.elapsed();
        debug!(request_id = %request_id, total_ms = total.as_millis() as u64, "Request latency");
        Some(total)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> LatencyStats {
        let inner = self.inner.lock();
        let agg = &inner.aggregate;
        let avg = if agg.count == 0 {
            Duration::ZERO
        } else {
            agg.total / u32::try_from(agg.count).unwrap_or(u32::MAX)
        };
        LatencyStats {
            total_requests: agg.count,
            avg_first_token_latency: avg.as_millis() as u64,
            max_first_token_latency: agg.max.as_millis() as u64,
            min_first_token_latency: agg.min.unwrap_or_default().as_millis() as u64,
            active_requests: inner.active.len(),
        }
    }

    /// Reset statistics; in-flight tracking is kept
    pub fn reset(&self) {
        self.inner.lock().aggregate = Aggregate::default();
    }

    /// Drop in-flight entries older than `max_age`; returns how many
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.active.len();
        inner.active.retain(|_, started| started.elapsed() <= max_age);
        before - inner.active.len()
    }
}

/// Periodic sweep of stale in-flight entries
#[derive(Debug)]
pub struct LatencySweepJob {
    monitor: Arc<LatencyMonitor>,
    max_age: Duration,
}

impl LatencySweepJob {
    /// Sweep entries older than [`STALE_AFTER`]
    #[must_use]
    pub fn new(monitor: Arc<LatencyMonitor>) -> Self {
        Self {
            monitor,
            max_age: STALE_AFTER,
        }
    }
}

#[async_trait]
impl PeriodicJob for LatencySweepJob {
    fn name(&self) -> &'static str {
        "latency_sweep"
    }

    async fn tick(&self) {
        let removed = self.monitor.sweep(self.max_age);
        if removed > 0 {
            debug!(removed = removed, "Swept stale latency entries");
        }
    }
}
