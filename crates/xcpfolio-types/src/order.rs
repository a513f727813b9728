//! The filled-order data model (spec.md §3, "Order (filled, from ledger)").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::primitive::{AssetName, BtcAddress, OrderHash, XCPFOLIO_PREFIX};

/// Lifecycle position of an order as reported by the ledger. The core only
/// ever acts on `Filled` orders; any other status observed where `Filled`
/// was expected is a validation error (spec §4.1 "Resolve buyer").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Expired,
}

/// A filled DEX order selling `XCPFOLIO.<asset>`. Immutable once observed;
/// the order hash is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_hash: OrderHash,
    pub block_index: u64,
    pub block_time: DateTime<Utc>,
    pub status: OrderStatus,
    /// The give-asset long name, e.g. `"XCPFOLIO.RAREPEPE"`.
    pub give_asset_long_name: String,
    /// Price in base units of the counter-asset (get-quantity).
    pub get_quantity: u64,
}

impl Order {
    /// The underlying asset this order is selling delivery rights to, or
    /// `None` if `give_asset_long_name` is not namespaced under
    /// `XCPFOLIO.` (a validation failure, not a parse failure: the order
    /// still exists, it's just not ours to fulfill).
    pub fn asset(&self) -> Option<AssetName> {
        AssetName::from_xcpfolio_long_name(&self.give_asset_long_name)
    }

    pub fn is_xcpfolio_order(&self) -> bool {
        self.give_asset_long_name.starts_with(XCPFOLIO_PREFIX)
    }
}

/// The counterparty addresses of an order match, as returned by
/// `getOrderMatches`. `tx0`/`tx1` mirror the ledger's match record; whichever
/// side is not us is the buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMatch {
    pub tx0_address: BtcAddress,
    pub tx1_address: BtcAddress,
    pub status: String,
}

impl OrderMatch {
    /// Resolves the buyer: the counterparty address that is not `us`.
    pub fn buyer(&self, us: &BtcAddress) -> Option<BtcAddress> {
        if &self.tx0_address == us {
            Some(self.tx1_address.clone())
        } else if &self.tx1_address == us {
            Some(self.tx0_address.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order(give_asset: &str) -> Order {
        Order {
            order_hash: OrderHash("deadbeef".into()),
            block_index: 100,
            block_time: Utc::now(),
            status: OrderStatus::Filled,
            give_asset_long_name: give_asset.to_string(),
            get_quantity: 500_000_000,
        }
    }

    #[test]
    fn asset_extracted_from_xcpfolio_long_name() {
        let order = sample_order("XCPFOLIO.RAREPEPE");
        assert!(order.is_xcpfolio_order());
        assert_eq!(order.asset().unwrap().0, "RAREPEPE");
    }

    #[test]
    fn non_xcpfolio_order_has_no_asset() {
        let order = sample_order("SOMEOTHERASSET");
        assert!(!order.is_xcpfolio_order());
        assert_eq!(order.asset(), None);
    }

    #[test]
    fn buyer_is_whichever_side_is_not_us() {
        let us = BtcAddress::from("1us");
        let them = BtcAddress::from("1them");
        let m = OrderMatch { tx0_address: us.clone(), tx1_address: them.clone(), status: "completed".into() };
        assert_eq!(m.buyer(&us), Some(them.clone()));

        let m2 = OrderMatch { tx0_address: them.clone(), tx1_address: us.clone(), status: "completed".into() };
        assert_eq!(m2.buyer(&us), Some(them));
    }

    #[test]
    fn buyer_is_none_if_we_are_neither_side() {
        let us = BtcAddress::from("1us");
        let m = OrderMatch {
            tx0_address: BtcAddress::from("1a"),
            tx1_address: BtcAddress::from("1b"),
            status: "completed".into(),
        };
        assert_eq!(m.buyer(&us), None);
    }
}
