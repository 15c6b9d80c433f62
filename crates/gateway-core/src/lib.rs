//! # Gateway Core
//!
//! Core types, traits, and error handling for the relay gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Channel and channel statistics
//! - Canonical chat request
//! - Per-request relay information and pricing basis
//! - Error taxonomy
//! - The durable ledger boundary
//! - Cancellable periodic tasks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod error;
pub mod ledger;
pub mod relay_info;
pub mod request;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use channel::{Channel, ChannelStat};
pub use error::{GatewayError, GatewayResult};
pub use ledger::{DeltaKind, Ledger, QuotaAccount, TokenRecord};
pub use relay_info::{PricingBasis, RelayInfo};
pub use request::{estimate_tokens, ChatMessage, ChatRequest};
pub use task::{spawn_periodic, PeriodicJob};
pub use types::{CallerIdentity, ChannelId, ProviderType, RequestId, TokenId, Usage, UserId};
