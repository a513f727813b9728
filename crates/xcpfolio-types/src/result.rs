//! The per-order outcome the fulfillment controller's public contract
//! returns (spec.md §7 "User-visible behavior").

use serde::{Deserialize, Serialize};

use crate::primitive::{AssetName, BtcAddress, OrderHash, TxId};
use crate::transfer::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOrderResult {
    pub order_hash: OrderHash,
    pub asset: AssetName,
    pub buyer: Option<BtcAddress>,
    pub success: bool,
    pub stage: Stage,
    pub txid: Option<TxId>,
    pub error: Option<String>,
    pub is_rbf: bool,
}

impl ProcessOrderResult {
    pub fn success(order_hash: OrderHash, asset: AssetName, buyer: BtcAddress, stage: Stage, txid: TxId) -> Self {
        Self {
            order_hash,
            asset,
            buyer: Some(buyer),
            success: true,
            stage,
            txid: Some(txid),
            error: None,
            is_rbf: false,
        }
    }

    pub fn failure(
        order_hash: OrderHash,
        asset: AssetName,
        buyer: Option<BtcAddress>,
        stage: Stage,
        error: impl Into<String>,
    ) -> Self {
        Self {
            order_hash,
            asset,
            buyer,
            success: false,
            stage,
            txid: None,
            error: Some(error.into()),
            is_rbf: false,
        }
    }

    pub fn with_rbf(mut self, is_rbf: bool) -> Self {
        self.is_rbf = is_rbf;
        self
    }
}

/// The outcome of one maintenance-controller asset listing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceResult {
    pub asset: AssetName,
    pub success: bool,
    pub txid: Option<TxId>,
    pub error: Option<String>,
}
