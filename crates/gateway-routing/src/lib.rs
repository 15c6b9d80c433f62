//! # Gateway Routing
//!
//! Channel registry and selection for the relay gateway.
//!
//! This crate provides:
//! - An atomically swapped snapshot of enabled channels, refreshed from the ledger
//! - Weighted random channel selection with round-robin fallback
//! - Per-channel attempt counters with fire-and-forget persistence

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;
pub mod selector;
pub mod stats;

// Re-export main types
pub use registry::{ChannelRegistry, RegistryRefreshJob};
pub use selector::{RandomSource, ThreadRandom, WeightedSelector};
pub use stats::{ChannelStats, ChannelStatSnapshot};
