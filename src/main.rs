//! # Relay Gateway
//!
//! OpenAI-compatible relay with weighted channel routing, quota
//! reservation and settlement, and SSE streaming.
//!
//! ## Usage
//!
//! ```bash
//! # Start with default configuration (in-memory ledger, no channels)
//! relay-gateway
//!
//! # Start with a config file
//! relay-gateway --config /path/to/config.yaml
//!
//! # Environment overrides
//! GATEWAY_PORT=9000 relay-gateway
//! ```

use anyhow::Context;
use clap::Parser;
use gateway_config::{load_config, GatewayConfig, LedgerBackend};
use gateway_core::Ledger;
use gateway_providers::{default_registry, ClientPool};
use gateway_quota::{InMemoryLedger, SqliteLedger};
use gateway_server::{shutdown_signal, AppState, Server};
use gateway_telemetry::{init_tracing, shutdown_tracing};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "relay-gateway", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };

    let tracer = match init_tracing(&config.logging) {
        Ok(tracer) => tracer,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting relay gateway");

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Gateway failed");
    }
    shutdown_tracing(tracer);

    if result.is_err() {
        std::process::exit(1);
    }
}

async fn open_ledger(config: &GatewayConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    let seeds = &config.ledger;
    match seeds.backend {
        LedgerBackend::Memory => {
            info!(
                channels = seeds.channels.len(),
                tokens = seeds.tokens.len(),
                "Using in-memory ledger"
            );
            Ok(Arc::new(InMemoryLedger::from_seeds(&seeds.channels, &seeds.tokens)))
        }
        LedgerBackend::Sqlite => {
            let ledger = SqliteLedger::connect(&seeds.database_url)
                .await
                .context("connecting to the SQLite ledger")?;
            ledger
                .seed(&seeds.channels, &seeds.tokens)
                .await
                .context("seeding the SQLite ledger")?;
            Ok(Arc::new(ledger))
        }
    }
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Configuration loaded"
    );

    let ledger = open_ledger(&config).await?;
    let clients = Arc::new(ClientPool::new(&config.upstream).context("building the upstream client")?);
    let adaptors = default_registry(&clients);
    let grace = config.server.shutdown_timeout;

    let state = AppState::build(config, ledger, adaptors).context("wiring the relay engine")?;
    let channels = state.registry().initialize().await;
    info!(channels = channels, "Channel registry ready");

    let token = state.shutdown.clone();
    let relays = state.relays.clone();
    let server = Server::new(state);
    let tasks = server.spawn_background_jobs();
    let listener = server.bind().await.context("binding the listen address")?;

    tokio::spawn({
        let token = token.clone();
        let relays = relays.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
            // Open streams hold the listener; cut them off once grace runs out
            tokio::time::sleep(grace).await;
            relays.cancel();
        }
    });

    let served = server.run(listener).await;

    // Relays settle first so the final flush sees their deltas
    token.cancel();
    relays.drain(grace).await;
    tasks.shutdown(grace).await;
    info!("Gateway stopped");

    served.context("serving HTTP")
}
