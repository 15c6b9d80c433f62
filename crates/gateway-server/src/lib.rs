//! # Gateway Server
//!
//! HTTP surface of the relay gateway.
//!
//! This crate provides:
//! - OpenAI-compatible `/v1/chat/completions` and `/v1/models`
//! - Health, readiness, metrics, channel and latency statistics endpoints
//! - HMAC-keyed fast-auth cache in front of the ledger
//! - Admission hook invoked before the relay engine
//! - Background job ownership and graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod auth;
pub mod body;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod state;

// Re-export main types
pub use admission::{Admission, AllowAll, Decision};
pub use auth::{bearer_key, AuthSweepJob, FastAuthCache};
pub use body::{channel_writer, ChannelWriter, PendingResponse};
pub use error::ApiError;
pub use routes::create_router;
pub use server::Server;
pub use shutdown::{shutdown_signal, BackgroundTasks, InFlightRelays};
pub use state::AppState;
