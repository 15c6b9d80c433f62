//! HTTP server lifecycle.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{auth::AuthSweepJob, routes::create_router, shutdown::BackgroundTasks, state::AppState};
use gateway_quota::AccumulatorFlushJob;
use gateway_routing::RegistryRefreshJob;
use gateway_telemetry::LatencySweepJob;

/// Interval of the latency monitor's stale-entry sweep
const LATENCY_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Gateway HTTP server
#[derive(Debug)]
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a server over `state`
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Shared state
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Start registry refresh, delta flush, auth sweep and latency sweep.
    ///
    /// The jobs run under their own token and keep going after the listener
    /// stops; [`BackgroundTasks::shutdown`] stops them once relays have
    /// drained, and the flush job applies pending deltas on the way out.
    #[must_use]
    pub fn spawn_background_jobs(&self) -> BackgroundTasks {
        let config = &self.state.config;
        let engine = &self.state.engine;
        let mut tasks = BackgroundTasks::new(CancellationToken::new());

        tasks.spawn(
            RegistryRefreshJob::new(engine.registry().clone()),
            config.routing.refresh_interval,
        );
        tasks.spawn(
            AccumulatorFlushJob::new(engine.quota().accumulator().clone()),
            config.quota.flush_interval,
        );
        if config.auth.cache_enabled {
            tasks.spawn(AuthSweepJob::new(self.state.auth.clone()), config.auth.sweep_interval);
        }
        tasks.spawn(LatencySweepJob::new(self.state.latency.clone()), LATENCY_SWEEP_INTERVAL);

        tasks
    }

    /// Bind the configured address
    ///
    /// # Errors
    /// Returns error if the address cannot be bound
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let server = &self.state.config.server;
        TcpListener::bind((server.host.as_str(), server.port)).await
    }

    /// Serve until the shutdown token is cancelled
    ///
    /// # Errors
    /// Returns error if the listener fails
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?addr, "Gateway listening");

        let token = self.state.shutdown.clone();
        let app = create_router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
