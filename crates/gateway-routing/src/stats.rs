//! In-memory per-channel attempt counters.

use dashmap::DashMap;
use gateway_core::{ChannelId, ChannelStat};
use serde::Serialize;

/// Point-in-time view of one channel's counters
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatSnapshot {
    /// Channel id
    pub id: ChannelId,
    /// Relay attempts
    pub total: u64,
    /// Successful attempts
    pub success: u64,
    /// `success / total`
    pub success_rate: f64,
}

/// Process-local counters, keyed by channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    counters: DashMap<ChannelId, ChannelStat>,
}

impl ChannelStats {
    /// Create empty counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt
    pub fn record(&self, channel_id: ChannelId, success: bool) {
        self.counters.entry(channel_id).or_default().record(success);
    }

    /// Counters for one channel
    #[must_use]
    pub fn get(&self, channel_id: ChannelId) -> ChannelStat {
        self.counters
            .get(&channel_id)
            .map(|stat| *stat)
            .unwrap_or_default()
    }

    /// All counters, ordered by channel id
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChannelStatSnapshot> {
        let mut out: Vec<ChannelStatSnapshot> = self
            .counters
            .iter()
            .map(|entry| ChannelStatSnapshot {
                id: *entry.key(),
                total: entry.total,
                success: entry.success,
                success_rate: entry.success_rate(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_and_snapshot() {
        let stats = ChannelStats::new();
        stats.record(2, true);
        stats.record(1, false);
        stats.record(2, false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, 1);
        assert_eq!(snapshot[0].success, 0);
        assert_eq!(snapshot[1].total, 2);
        assert!((snapshot[1].success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.get(99), ChannelStat::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_success_never_exceeds_total_under_contention() {
        let stats = Arc::new(ChannelStats::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..500 {
                    stats.record(1, (i + j) % 3 == 0);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stat = stats.get(1);
        assert_eq!(stat.total, 4_000);
        assert!(stat.success <= stat.total);
    }
}
