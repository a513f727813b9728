//! HTTP client for the Counterparty-style DEX/indexer ledger (spec.md §4.4,
//! §6.2): order discovery, asset info, and compose operations.

pub mod client;
pub mod error;
pub mod types;

pub use client::{HttpLedgerClient, LedgerClient};
pub use error::LedgerError;
pub use types::{
    AssetInfo, AssetIssuance, ComposedTransaction, CurrentBlock, MempoolOrderEvent, OrderStatusFilter,
    XcpfolioBalance,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_filter_query_values() {
        assert_eq!(OrderStatusFilter::Filled.as_query_value(), "filled");
        assert_eq!(OrderStatusFilter::Open.as_query_value(), "open");
    }
}
