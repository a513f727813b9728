//! Wire types for the Counterparty-style ledger API (spec.md §6.2). Only the
//! fields the core actually reads are modeled; unknown fields are ignored by
//! serde's default behavior.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use xcpfolio_types::{AssetName, BtcAddress};

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub result: T,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentBlock {
    pub block_index: u64,
    pub block_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetInfo {
    pub asset: String,
    pub owner: BtcAddress,
    pub locked: bool,
    pub supply: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetIssuance {
    pub tx_hash: String,
    pub quantity: u64,
    pub transfer: bool,
    pub status: String,
}

impl AssetIssuance {
    /// The most plausible transfer-to-buyer issuance: a `transfer` entry
    /// that isn't itself an error.
    pub fn is_completed_transfer(&self) -> bool {
        self.transfer && self.status == "valid"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MempoolOrderEvent {
    pub give_asset: String,
    pub get_asset: String,
    pub source: BtcAddress,
    /// Present on mempool issuance-transfer events (`/addresses/mempool`);
    /// absent on `OPEN_ORDER` events. Used to key the (asset, buyer) pending-
    /// transfer set the fulfillment controller dedups against (spec.md
    /// §4.1 step 2).
    #[serde(default)]
    pub destination: Option<BtcAddress>,
    /// Present on `OPEN_ORDER` mempool events; used only to key the
    /// order-history side-channel record published for UI visibility
    /// (spec.md §4.1 step 5). Absent on transfer events.
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposedTransaction {
    pub rawtransaction: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XcpfolioBalance {
    pub asset: AssetName,
    pub quantity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusFilter {
    Filled,
    Open,
}

impl OrderStatusFilter {
    pub fn as_query_value(self) -> &'static str {
        match self {
            OrderStatusFilter::Filled => "filled",
            OrderStatusFilter::Open => "open",
        }
    }
}
