//! Ledger implementations.
//!
//! [`InMemoryLedger`] backs tests and single-process deployments that do not
//! need balances to survive a restart. [`SqliteLedger`] persists everything.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::{AppliedDelta, InMemoryLedger};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;
