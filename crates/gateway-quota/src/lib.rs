//! # Gateway Quota
//!
//! Quota metering for the relay gateway.
//!
//! This crate provides:
//! - Pricing: reservation estimates and actual cost from reported usage
//! - Reservations that are settled or refunded exactly once
//! - A batched delta accumulator that defers ledger writes
//! - Ledger implementations (in-memory and SQLite)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accumulator;
pub mod ledger;
pub mod pricing;
pub mod reservation;

// Re-export main types
pub use accumulator::{AccumulatorFlushJob, DeltaAccumulator, FlushReport};
pub use ledger::{AppliedDelta, InMemoryLedger};
#[cfg(feature = "sqlite")]
pub use ledger::SqliteLedger;
pub use pricing::Pricing;
pub use reservation::{QuotaCounters, QuotaReservation, QuotaService, Settlement};
