//! Swap state
//!
//! Handles:
//! - Swap records and the lifecycle edge table
//! - The in-memory ledger with compare-and-swap transitions
//! - Retention and capacity eviction

mod ledger;
mod record;

pub use ledger::{EvictionReport, LedgerStats, SwapLedger};
pub use record::{
    DestinationParties, HashAlgorithm, LifecycleState, SourceParties, SwapId, SwapRecord,
    SwapSnapshot, SwapUpdate,
};

#[cfg(test)]
pub(crate) use ledger::tests::record as test_record;
