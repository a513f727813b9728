//! Process-wide counters and gauges (SPEC_FULL.md §6: ambient observability,
//! not a feature spec.md's Non-goals name). Thin wrappers over the `metrics`
//! facade so call sites read like a sentence instead of repeating metric
//! name strings.

/// Call once per order the fulfillment controller finishes processing,
/// regardless of outcome.
pub fn order_processed(stage: &'static str, success: bool) {
    metrics::counter!("xcpfolio_orders_processed_total", "stage" => stage, "success" => success.to_string())
        .increment(1);
}

/// Call on every transaction that actually reaches `broadcast_transaction`,
/// original or RBF replacement.
pub fn broadcast_sent(is_rbf: bool) {
    metrics::counter!("xcpfolio_broadcasts_total", "rbf" => is_rbf.to_string()).increment(1);
}

pub fn rbf_escalation() {
    metrics::counter!("xcpfolio_rbf_escalations_total").increment(1);
}

pub fn rbf_abandoned() {
    metrics::counter!("xcpfolio_rbf_abandoned_total").increment(1);
}

/// The number of in-process active-transaction records at the end of a
/// fulfillment run (spec §8 "Active-tx cap").
pub fn active_transactions(count: u64) {
    metrics::gauge!("xcpfolio_active_transactions").set(count as f64);
}

/// Call once per maintenance-controller asset outcome.
pub fn maintenance_listing(success: bool) {
    metrics::counter!("xcpfolio_maintenance_listings_total", "success" => success.to_string()).increment(1);
}

pub fn maintenance_run_aborted(reason: &'static str) {
    metrics::counter!("xcpfolio_maintenance_aborts_total", "reason" => reason).increment(1);
}

/// Wall-clock duration of one controller run, in seconds.
pub fn run_duration_seconds(controller: &'static str, seconds: f64) {
    metrics::histogram!("xcpfolio_run_duration_seconds", "controller" => controller).record(seconds);
}
