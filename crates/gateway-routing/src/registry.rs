//! Channel registry.
//!
//! Holds the in-memory snapshot of enabled channels. `refresh` builds a new
//! list from the ledger and swaps it in whole, so readers either see the old
//! list or the new one and never a mix.

use crate::selector::WeightedSelector;
use crate::stats::ChannelStats;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use gateway_core::{
    Channel, ChannelId, GatewayError, GatewayResult, Ledger, PeriodicJob,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot of enabled channels plus selection and outcome bookkeeping
pub struct ChannelRegistry {
    ledger: Arc<dyn Ledger>,
    snapshot: ArcSwap<Vec<Arc<Channel>>>,
    selector: WeightedSelector,
    stats: ChannelStats,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.snapshot.load().len())
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// Create an empty registry; call [`Self::initialize`] before serving
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            selector: WeightedSelector::new(),
            stats: ChannelStats::new(),
        }
    }

    /// Replace the selector (tests inject a fixed draw)
    #[must_use]
    pub fn with_selector(mut self, selector: WeightedSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Load enabled channels and swap them in.
    ///
    /// On error the previous snapshot stays in place.
    pub async fn refresh(&self) -> GatewayResult<usize> {
        let channels: Vec<Arc<Channel>> = self
            .ledger
            .load_enabled_channels()
            .await?
            .into_iter()
            .filter(|c| c.enabled)
            .map(Arc::new)
            .collect();

        let count = channels.len();
        self.snapshot.store(Arc::new(channels));
        debug!(channels = count, "Channel snapshot refreshed");
        Ok(count)
    }

    /// First load at startup, retried once.
    ///
    /// A second failure leaves the registry empty; the periodic refresh will
    /// keep trying.
    pub async fn initialize(&self) -> usize {
        match self.refresh().await {
            Ok(count) => {
                info!(channels = count, "Channel cache initialized");
                count
            }
            Err(first) => {
                warn!(error = %first, "Channel cache initialization failed, retrying once");
                match self.refresh().await {
                    Ok(count) => {
                        info!(channels = count, "Channel cache initialized on retry");
                        count
                    }
                    Err(second) => {
                        error!(
                            error = %second,
                            "Channel cache initialization failed twice, starting empty"
                        );
                        0
                    }
                }
            }
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Channel>>> {
        self.snapshot.load_full()
    }

    /// Number of cached channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// No channels cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached channel by id
    #[must_use]
    pub fn get(&self, channel_id: ChannelId) -> Option<Arc<Channel>> {
        self.snapshot
            .load()
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
    }

    /// Pick any channel from the snapshot
    pub fn select(&self) -> GatewayResult<Arc<Channel>> {
        let snapshot = self.snapshot.load();
        self.selector
            .pick(&snapshot)
            .cloned()
            .ok_or_else(|| GatewayError::NoChannelAvailable {
                model: "*".to_string(),
            })
    }

    /// Pick a channel that serves `model`
    pub fn select_for_model(&self, model: &str) -> GatewayResult<Arc<Channel>> {
        let candidates: Vec<Arc<Channel>> = self
            .snapshot
            .load()
            .iter()
            .filter(|c| c.supports_model(model))
            .cloned()
            .collect();

        self.selector
            .pick(&candidates)
            .cloned()
            .ok_or_else(|| GatewayError::NoChannelAvailable {
                model: model.to_string(),
            })
    }

    /// Models explicitly listed by cached channels, sorted
    #[must_use]
    pub fn models(&self) -> Vec<String> {
        self.snapshot
            .load()
            .iter()
            .flat_map(|c| c.models.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Record a relay outcome.
    ///
    /// In-memory counters update immediately; the ledger write runs on a
    /// detached task and its errors are only logged.
    pub fn report(&self, channel_id: ChannelId, success: bool) {
        self.stats.record(channel_id, success);

        let ledger = self.ledger.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ledger.record_channel_outcome(channel_id, success).await {
                        warn!(
                            channel_id = channel_id,
                            success = success,
                            error = %e,
                            "Failed to persist channel outcome"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(channel_id = channel_id, "No runtime, channel outcome not persisted");
            }
        }
    }

    /// In-memory counters
    #[must_use]
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}

/// Periodic snapshot refresh
#[derive(Debug)]
pub struct RegistryRefreshJob {
    registry: Arc<ChannelRegistry>,
}

impl RegistryRefreshJob {
    /// Refresh `registry` on every tick
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PeriodicJob for RegistryRefreshJob {
    fn name(&self) -> &'static str {
        "channel_refresh"
    }

    async fn tick(&self) {
        if let Err(e) = self.registry.refresh().await {
            warn!(error = %e, "Channel refresh failed, keeping previous snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::RandomSource;
    use gateway_core::ProviderType;
    use gateway_quota::InMemoryLedger;
    use std::time::Duration;

    struct FixedDraw(u64);

    impl RandomSource for FixedDraw {
        fn draw(&self, _upper: u64) -> u64 {
            self.0
        }
    }

    fn ledger_with(channels: Vec<Channel>) -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new());
        for channel in channels {
            ledger.upsert_channel(channel);
        }
        ledger
    }

    #[tokio::test]
    async fn test_empty_registry_has_no_channel() {
        let registry = ChannelRegistry::new(ledger_with(vec![]));
        assert_eq!(registry.initialize().await, 0);
        assert!(matches!(
            registry.select(),
            Err(GatewayError::NoChannelAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_skips_disabled_channels() {
        let ledger = ledger_with(vec![
            Channel::new(1, ProviderType::OpenAI, "a"),
            Channel::new(2, ProviderType::OpenAI, "b").with_enabled(false),
        ]);
        let registry = ChannelRegistry::new(ledger);

        assert_eq!(registry.refresh().await.unwrap(), 1);
        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot_and_old_readers_keep_theirs() {
        let ledger = ledger_with(vec![Channel::new(1, ProviderType::OpenAI, "a")]);
        let registry = ChannelRegistry::new(ledger.clone());
        registry.refresh().await.unwrap();

        let before = registry.snapshot();
        ledger.upsert_channel(Channel::new(2, ProviderType::OpenAI, "b"));
        registry.refresh().await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let ledger = ledger_with(vec![Channel::new(1, ProviderType::OpenAI, "a")]);
        let registry = ChannelRegistry::new(ledger.clone());
        registry.refresh().await.unwrap();

        ledger.fail_next_channel_loads(1);
        assert!(registry.refresh().await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_retries_once() {
        let ledger = ledger_with(vec![Channel::new(1, ProviderType::OpenAI, "a")]);
        ledger.fail_next_channel_loads(1);
        let registry = ChannelRegistry::new(ledger.clone());
        assert_eq!(registry.initialize().await, 1);

        let ledger = ledger_with(vec![Channel::new(1, ProviderType::OpenAI, "a")]);
        ledger.fail_next_channel_loads(2);
        let registry = ChannelRegistry::new(ledger);
        assert_eq!(registry.initialize().await, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_select_scenario_draws() {
        let ledger = ledger_with(vec![
            Channel::new(1, ProviderType::OpenAI, "a").with_weight(0),
            Channel::new(2, ProviderType::OpenAI, "b").with_weight(4),
        ]);

        let registry = ChannelRegistry::new(ledger.clone())
            .with_selector(WeightedSelector::with_random(Arc::new(FixedDraw(0))));
        registry.refresh().await.unwrap();
        assert_eq!(registry.select().unwrap().id, 1);

        let registry = ChannelRegistry::new(ledger)
            .with_selector(WeightedSelector::with_random(Arc::new(FixedDraw(5))));
        registry.refresh().await.unwrap();
        assert_eq!(registry.select().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_select_for_model_filters() {
        let ledger = ledger_with(vec![
            Channel::new(1, ProviderType::OpenAI, "a").with_models(["gpt-4o"]),
            Channel::new(2, ProviderType::DeepSeek, "b").with_models(["deepseek-chat"]),
        ]);
        let registry = ChannelRegistry::new(ledger);
        registry.refresh().await.unwrap();

        for _ in 0..20 {
            assert_eq!(registry.select_for_model("deepseek-chat").unwrap().id, 2);
        }
        assert!(matches!(
            registry.select_for_model("claude-3"),
            Err(GatewayError::NoChannelAvailable { ref model }) if model == "claude-3"
        ));
        assert_eq!(registry.models(), vec!["deepseek-chat", "gpt-4o"]);
    }

    #[tokio::test]
    async fn test_report_updates_counters_and_ledger() {
        let ledger = ledger_with(vec![Channel::new(1, ProviderType::OpenAI, "a")]);
        let registry = ChannelRegistry::new(ledger.clone());

        registry.report(1, true);
        registry.report(1, false);

        let stat = registry.stats().get(1);
        assert_eq!((stat.total, stat.success), (2, 1));

        // persistence is detached; give it a moment
        for _ in 0..50 {
            if ledger.channel_stat(1).total == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let persisted = ledger.channel_stat(1);
        assert_eq!((persisted.total, persisted.success), (2, 1));
    }

    #[tokio::test]
    async fn test_report_swallows_ledger_errors() {
        let ledger = ledger_with(vec![]);
        ledger.fail_stat_writes(true);
        let registry = ChannelRegistry::new(ledger);

        registry.report(9, true);
        tokio::task::yield_now().await;

        assert_eq!(registry.stats().get(9).total, 1);
    }

    #[tokio::test]
    async fn test_refresh_job_tick() {
        let ledger = ledger_with(vec![]);
        let registry = Arc::new(ChannelRegistry::new(ledger.clone()));
        let job = RegistryRefreshJob::new(registry.clone());

        ledger.upsert_channel(Channel::new(5, ProviderType::OpenAI, "k"));
        job.tick().await;
        assert!(registry.get(5).is_some());
    }
}
