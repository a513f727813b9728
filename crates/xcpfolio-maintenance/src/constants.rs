//! Tunable constants named by spec.md §4.2 that aren't already part of
//! `Config`.

use std::time::Duration;

/// spec.md §4.2 "Coordination": `xcpfolio:maintenance:lock`, TTL 5 minutes.
pub const LOCK_KEY: &str = "xcpfolio:maintenance:lock";
pub const LOCK_TTL: Duration = Duration::from_secs(5 * 60);

pub(crate) const STATE_KEY: &str = "xcpfolio:maintenance:state";

/// spec.md §3 "Maintenance active-order map": "Entries expire by TTL (e.g. 2
/// hours)". The envelope itself has no per-entry TTL, so staleness is
/// computed at read time against `broadcast_time`.
pub const ACTIVE_ORDER_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// spec.md §4.2 step 11: "sleep a verification delay (e.g. 2s)".
pub const VERIFY_DELAY: Duration = Duration::from_secs(2);

/// Brief pause before re-checking the mempool after a failed compose/sign/
/// broadcast, to give a possibly-lost-response broadcast time to propagate.
pub const ERROR_RECHECK_DELAY: Duration = Duration::from_secs(1);

/// spec.md §4.2 step 11: "same `txid:vout` in error text, ≥3 times
/// consecutively" aborts the run.
pub const STALE_UTXO_REPEAT_THRESHOLD: u32 = 3;

/// The counter-asset every re-listed order prices in.
pub const COUNTER_ASSET: &str = "XCP";

/// XCP, like BTC, has 8 decimal places; `priceTable` values are whole-XCP
/// prices (spec §4.2 step 11: "get `price x 10^8` units").
pub const SATOSHIS_PER_XCP: u64 = 100_000_000;

/// Re-listed orders give exactly one unit of the `XCPFOLIO.<asset>` subasset.
pub const GIVE_QUANTITY: u64 = 1;
