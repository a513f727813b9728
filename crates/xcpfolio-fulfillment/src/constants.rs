//! Tunable constants named by spec.md §4.1 that aren't already part of
//! `Config` (those are operator-configurable; these are fixed algorithm
//! parameters).

use std::time::Duration;

/// Single-input transfer transactions are small and uniform enough that a
/// fixed vsize estimate is accurate for the fee-ceiling math; matches
/// `testing_support::FakeSigner`'s default vsize so tests exercise the same
/// arithmetic the real signer would produce for this transaction shape.
pub const ESTIMATED_VSIZE_TRANSFER: u64 = 140;

/// spec.md §4.1 step 3: "if `currentBlock - lastCleanup >= 100`".
pub const CLEANUP_INTERVAL_BLOCKS: u64 = 100;
pub const CLEANUP_KEEP: usize = 100;

/// spec.md §4.1 step 7: stop scanning once this many consecutive
/// already-processed orders have been seen.
pub const CONSECUTIVE_ALREADY_PROCESSED_STOP: u32 = 10;

/// spec.md §4.1 RBF escalation: "protective cap `newRate <= 500 sat/vB`".
pub const PROTECTIVE_FEE_RATE_CAP: u64 = 500;

/// spec.md §6.2: ledger order pagination ("paginating until the page is
/// short").
pub const ORDERS_PAGE_SIZE: u32 = 100;

/// spec.md §6.5: `fulfillment-state` TTL.
pub const ENVELOPE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub(crate) const STATE_KEY: &str = "fulfillment-state";
