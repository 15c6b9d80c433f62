//! Batched delta accumulator.
//!
//! Settlement and refund deltas are not written to the ledger inline. They
//! are summed per `(kind, id)` in memory and a periodic flush applies one
//! additive update per id. Each kind has its own bucket lock for accumulation
//! and its own flush lock, so flushes of the same kind never overlap while
//! different kinds flush concurrently.

use async_trait::async_trait;
use futures::future::join_all;
use gateway_core::{DeltaKind, Ledger, PeriodicJob};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Bucket {
    pending: Mutex<HashMap<i64, i64>>,
    flushing: tokio::sync::Mutex<()>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            flushing: tokio::sync::Mutex::new(()),
        }
    }
}

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Updates applied
    pub applied: usize,
    /// Updates that failed and were put back
    pub requeued: usize,
}

impl FlushReport {
    /// Nothing happened
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied == 0 && self.requeued == 0
    }
}

/// Pending ledger deltas, keyed by update kind and entity id
pub struct DeltaAccumulator {
    ledger: Arc<dyn Ledger>,
    buckets: HashMap<DeltaKind, Bucket>,
}

impl std::fmt::Debug for DeltaAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaAccumulator")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl DeltaAccumulator {
    /// Create an empty accumulator that flushes into `ledger`
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            buckets: DeltaKind::ALL.iter().map(|k| (*k, Bucket::new())).collect(),
        }
    }

    fn bucket(&self, kind: DeltaKind) -> &Bucket {
        // every kind is inserted in `new`
        &self.buckets[&kind]
    }

    /// Add `delta` to the pending value for `(kind, id)`; zero is a no-op
    pub fn add(&self, kind: DeltaKind, id: i64, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.bucket(kind).pending.lock().entry(id).or_insert(0) += delta;
    }

    /// Pending value for `(kind, id)`
    #[must_use]
    pub fn pending(&self, kind: DeltaKind, id: i64) -> i64 {
        self.bucket(kind)
            .pending
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of pending `(kind, id)` entries
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.buckets.values().map(|b| b.pending.lock().len()).sum()
    }

    /// Drain every bucket and apply it.
    ///
    /// Updates that fail are added back so the next flush retries them.
    pub async fn flush(&self) -> FlushReport {
        let reports = join_all(DeltaKind::ALL.iter().map(|kind| self.flush_kind(*kind))).await;

        let total = reports.into_iter().fold(FlushReport::default(), |acc, r| FlushReport {
            applied: acc.applied + r.applied,
            requeued: acc.requeued + r.requeued,
        });
        if !total.is_empty() {
            debug!(
                applied = total.applied,
                requeued = total.requeued,
                "Delta accumulator flushed"
            );
        }
        total
    }

    async fn flush_kind(&self, kind: DeltaKind) -> FlushReport {
        let bucket = self.bucket(kind);
        let _serial = bucket.flushing.lock().await;

        let drained = std::mem::take(&mut *bucket.pending.lock());
        let mut report = FlushReport::default();

        for (id, delta) in drained {
            if delta == 0 {
                continue;
            }
            match self.ledger.apply_delta(kind, id, delta).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(
                        kind = %kind,
                        id = id,
                        delta = delta,
                        error = %e,
                        "Failed to apply batched delta, requeueing"
                    );
                    *bucket.pending.lock().entry(id).or_insert(0) += delta;
                    report.requeued += 1;
                }
            }
        }
        report
    }
}

/// Periodic accumulator flush; flushes once more on shutdown
#[derive(Debug)]
pub struct AccumulatorFlushJob {
    accumulator: Arc<DeltaAccumulator>,
}

impl AccumulatorFlushJob {
    /// Flush `accumulator` on every tick
    #[must_use]
    pub fn new(accumulator: Arc<DeltaAccumulator>) -> Self {
        Self { accumulator }
    }
}

#[async_trait]
impl PeriodicJob for AccumulatorFlushJob {
    fn name(&self) -> &'static str {
        "delta_flush"
    }

    async fn tick(&self) {
        self.accumulator.flush().await;
    }

    async fn on_shutdown(&self) {
        let report = self.accumulator.flush().await;
        info!(
            applied = report.applied,
            requeued = report.requeued,
            "Final delta flush complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AppliedDelta, InMemoryLedger};
    use gateway_core::{spawn_periodic, QuotaAccount};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Arc<InMemoryLedger>, Arc<DeltaAccumulator>) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.insert_user(1, 1_000, "default");
        let accumulator = Arc::new(DeltaAccumulator::new(ledger.clone()));
        (ledger, accumulator)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_flush_as_one_update() {
        let (ledger, accumulator) = setup();
        let n = 64;
        let d = -7;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let accumulator = accumulator.clone();
                tokio::spawn(async move { accumulator.add(DeltaKind::UserQuota, 1, d) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(accumulator.pending(DeltaKind::UserQuota, 1), n * d);

        let report = accumulator.flush().await;
        assert_eq!(report.applied, 1);
        assert_eq!(
            ledger.applied_deltas(),
            vec![AppliedDelta {
                kind: DeltaKind::UserQuota,
                id: 1,
                delta: n * d
            }]
        );
        assert_eq!(
            ledger.balance(QuotaAccount::User(1)).await.unwrap(),
            1_000 + n * d
        );

        let second = accumulator.flush().await;
        assert!(second.is_empty());
        assert_eq!(ledger.applied_deltas().len(), 1);
    }

    #[tokio::test]
    async fn test_kinds_are_kept_apart() {
        let (ledger, accumulator) = setup();
        accumulator.add(DeltaKind::UsedQuota, 1, 10);
        accumulator.add(DeltaKind::RequestCount, 1, 1);
        accumulator.add(DeltaKind::ChannelUsedQuota, 3, 10);
        accumulator.add(DeltaKind::UserQuota, 1, 0);

        assert_eq!(accumulator.pending_count(), 3);
        let report = accumulator.flush().await;
        assert_eq!(report.applied, 3);
        assert_eq!(ledger.used_quota(1), 10);
        assert_eq!(ledger.request_count(1), 1);
        assert_eq!(ledger.channel_used_quota(3), 10);
        assert_eq!(accumulator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_updates_are_requeued() {
        let (ledger, accumulator) = setup();
        accumulator.add(DeltaKind::UserQuota, 1, 50);

        ledger.fail_delta_writes(true);
        let report = accumulator.flush().await;
        assert_eq!(report.requeued, 1);
        assert_eq!(accumulator.pending(DeltaKind::UserQuota, 1), 50);

        accumulator.add(DeltaKind::UserQuota, 1, 5);
        ledger.fail_delta_writes(false);
        let report = accumulator.flush().await;
        assert_eq!(report.applied, 1);
        assert_eq!(ledger.balance(QuotaAccount::User(1)).await.unwrap(), 1_055);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_and_final_flush_on_shutdown() {
        let (ledger, accumulator) = setup();
        let token = CancellationToken::new();
        let handle = spawn_periodic(
            Arc::new(AccumulatorFlushJob::new(accumulator.clone())),
            Duration::from_secs(5),
            token.clone(),
        );

        accumulator.add(DeltaKind::UserQuota, 1, -100);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ledger.applied_deltas().len(), 1);

        accumulator.add(DeltaKind::UserQuota, 1, -1);
        token.cancel();
        handle.await.unwrap();
        assert_eq!(ledger.applied_deltas().len(), 2);
        assert_eq!(ledger.balance(QuotaAccount::User(1)).await.unwrap(), 899);
    }
}
