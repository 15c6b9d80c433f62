//! Application state shared across handlers.

use gateway_config::GatewayConfig;
use gateway_core::{GatewayError, GatewayResult, Ledger};
use gateway_quota::{DeltaAccumulator, Pricing, QuotaService};
use gateway_relay::{AdaptorRegistry, RelayEngine};
use gateway_routing::ChannelRegistry;
use gateway_telemetry::{LatencyMonitor, RelayMetrics};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, AllowAll};
use crate::auth::FastAuthCache;
use crate::shutdown::InFlightRelays;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration
    pub config: Arc<GatewayConfig>,
    /// Relay engine
    pub engine: Arc<RelayEngine>,
    /// Fast-auth cache
    pub auth: Arc<FastAuthCache>,
    /// Admission hook
    pub admission: Arc<dyn Admission>,
    /// Relay metrics
    pub metrics: Arc<RelayMetrics>,
    /// First-byte latency monitor
    pub latency: Arc<LatencyMonitor>,
    /// Stops the HTTP listener
    pub shutdown: CancellationToken,
    /// Relays spawned by handlers, drained before the final flush
    pub relays: InFlightRelays,
    /// Server start time
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engine", &self.engine)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire the engine and its collaborators from configuration.
    ///
    /// The channel registry starts empty; call
    /// [`ChannelRegistry::initialize`] before serving.
    ///
    /// # Errors
    /// Returns error if metrics cannot be registered or the auth key is invalid
    pub fn build(
        config: GatewayConfig,
        ledger: Arc<dyn Ledger>,
        adaptors: AdaptorRegistry,
    ) -> GatewayResult<Self> {
        let metrics = Arc::new(
            RelayMetrics::new()
                .map_err(|e| GatewayError::internal(format!("Failed to register metrics: {e}")))?,
        );
        let latency = Arc::new(LatencyMonitor::new());

        let registry = Arc::new(ChannelRegistry::new(ledger.clone()));
        let accumulator = Arc::new(DeltaAccumulator::new(ledger.clone()));
        let quota = QuotaService::new(ledger.clone(), accumulator);
        let pricing = Arc::new(Pricing::new(config.pricing.clone(), &config.quota));

        let engine = RelayEngine::new(
            registry,
            Arc::new(adaptors),
            quota,
            pricing,
            config.streaming.clone(),
        )
        .with_upstream_config(config.upstream.clone())
        .with_metrics(metrics.clone())
        .with_latency_monitor(latency.clone());

        let auth = FastAuthCache::new(ledger, &config.auth)?;

        Ok(Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            auth: Arc::new(auth),
            admission: Arc::new(AllowAll),
            metrics,
            latency,
            shutdown: CancellationToken::new(),
            relays: InFlightRelays::new(),
            started_at: Instant::now(),
        })
    }

    /// Replace the admission hook
    #[must_use]
    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = admission;
        self
    }

    /// Stop the listener when `token` is cancelled
    #[must_use]
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Channel registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        self.engine.registry()
    }
}
