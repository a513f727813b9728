//! Durable state envelopes (spec.md §3 "Durable state envelope", §6.5).
//!
//! These are the only two objects written to the state store as full-object
//! overwrites. Both carry their own bounded-size invariants so that
//! "append to processedOrders" can never grow the envelope without limit.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureRecord;
use crate::primitive::{AssetName, OrderHash, TxId};

/// Most-recent processed order hashes are kept; older ones are truncated.
/// Spec: "Bounded size (truncate to most-recent N, e.g. 1000)."
pub const MAX_PROCESSED_ORDERS: usize = 1000;

/// `fulfillment-state` (spec §6.5), TTL 30 days at the state-store layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentEnvelope {
    pub last_block: u64,
    pub last_order_hash: Option<OrderHash>,
    pub last_checked: DateTime<Utc>,
    pub processed_orders: VecDeque<OrderHash>,
    pub failed_orders: HashMap<OrderHash, FailureRecord>,
    pub last_cleanup: u64,
}

impl Default for FulfillmentEnvelope {
    fn default() -> Self {
        Self {
            last_block: 0,
            last_order_hash: None,
            last_checked: Utc::now(),
            processed_orders: VecDeque::new(),
            failed_orders: HashMap::new(),
            last_cleanup: 0,
        }
    }
}

impl FulfillmentEnvelope {
    pub fn is_processed(&self, order_hash: &OrderHash) -> bool {
        self.processed_orders.contains(order_hash)
    }

    /// Marks an order processed, pushing it to the back (most-recent) and
    /// truncating the front until the bound holds.
    pub fn mark_processed(&mut self, order_hash: OrderHash) {
        if self.is_processed(&order_hash) {
            return;
        }
        self.processed_orders.push_back(order_hash);
        while self.processed_orders.len() > MAX_PROCESSED_ORDERS {
            self.processed_orders.pop_front();
        }
    }

    /// Truncates to the most-recent `keep` entries. Used by the periodic
    /// cleanup pass (spec §4.1 step 3), which keeps only the most-recent 100.
    pub fn truncate_processed(&mut self, keep: usize) {
        while self.processed_orders.len() > keep {
            self.processed_orders.pop_front();
        }
    }
}

/// One entry in the maintenance controller's durable active-order map.
/// `txid: None` represents the `"pending"` placeholder sentinel written
/// before composing, to seal the race window (spec §4.2 step 11).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOrderEntry {
    pub asset: AssetName,
    pub txid: Option<TxId>,
    pub broadcast_time: DateTime<Utc>,
    pub price: u64,
}

/// `failedAssets` entry, cleared at the start of each maintenance run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAssetEntry {
    pub count: u32,
    pub last_error: String,
    pub last_attempt_time: DateTime<Utc>,
}

/// `xcpfolio:maintenance:state` (spec §6.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceEnvelope {
    pub last_run: Option<DateTime<Utc>>,
    pub active_orders: HashMap<AssetName, ActiveOrderEntry>,
    pub failed_assets: HashMap<AssetName, FailedAssetEntry>,
}

impl Default for MaintenanceEnvelope {
    fn default() -> Self {
        Self { last_run: None, active_orders: HashMap::new(), failed_assets: HashMap::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn truncation_keeps_most_recent() {
        let mut env = FulfillmentEnvelope::default();
        for i in 0..MAX_PROCESSED_ORDERS + 10 {
            env.mark_processed(OrderHash(format!("h{i}")));
        }
        assert_eq!(env.processed_orders.len(), MAX_PROCESSED_ORDERS);
        assert!(env.is_processed(&OrderHash(format!("h{}", MAX_PROCESSED_ORDERS + 9))));
        assert!(!env.is_processed(&OrderHash("h0".to_string())));
    }

    #[test]
    fn marking_already_processed_is_idempotent() {
        let mut env = FulfillmentEnvelope::default();
        env.mark_processed(OrderHash("h".into()));
        env.mark_processed(OrderHash("h".into()));
        assert_eq!(env.processed_orders.len(), 1);
    }

    proptest! {
        #[test]
        fn serialize_deserialize_is_identity_up_to_truncation(hashes in proptest::collection::vec("[a-z]{1,8}", 0..50)) {
            let mut env = FulfillmentEnvelope::default();
            for h in hashes {
                env.mark_processed(OrderHash(h));
            }
            let json = serde_json::to_string(&env).unwrap();
            let round_tripped: FulfillmentEnvelope = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(round_tripped.processed_orders, env.processed_orders);
            prop_assert_eq!(round_tripped.last_block, env.last_block);
        }
    }
}
