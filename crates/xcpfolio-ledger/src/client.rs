//! The ledger client the fulfillment and maintenance controllers consume
//! (spec.md §4.4). Modeled as an object-safe async trait so controllers hold
//! a `Arc<dyn LedgerClient>` and tests substitute a fake.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::instrument;

use xcpfolio_types::{AssetName, BtcAddress, Order, OrderHash, OrderMatch};

use crate::error::LedgerError;
use crate::types::{AssetInfo, AssetIssuance, ComposedTransaction, CurrentBlock, Envelope, MempoolOrderEvent, OrderStatusFilter, XcpfolioBalance};

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_current_block(&self) -> Result<CurrentBlock, LedgerError>;

    async fn get_orders_by_address(
        &self,
        address: &BtcAddress,
        status: OrderStatusFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, LedgerError>;

    async fn get_order_matches(&self, order_hash: &OrderHash) -> Result<Vec<OrderMatch>, LedgerError>;

    async fn get_asset_info(&self, asset: &AssetName) -> Result<AssetInfo, LedgerError>;

    async fn get_asset_issuances(&self, asset: &AssetName) -> Result<Vec<AssetIssuance>, LedgerError>;

    async fn get_mempool_buy_orders(&self) -> Result<Vec<MempoolOrderEvent>, LedgerError>;

    async fn get_mempool_transfers(&self, address: &BtcAddress) -> Result<Vec<MempoolOrderEvent>, LedgerError>;

    async fn get_mempool_order_assets(&self, address: &BtcAddress) -> Result<Vec<AssetName>, LedgerError>;

    async fn get_open_order_assets(&self, address: &BtcAddress) -> Result<Vec<AssetName>, LedgerError>;

    async fn get_xcpfolio_balances(&self, address: &BtcAddress) -> Result<Vec<XcpfolioBalance>, LedgerError>;

    async fn compose_transfer(
        &self,
        source: &BtcAddress,
        asset: &AssetName,
        destination: &BtcAddress,
        fee_rate: u64,
        validate: bool,
    ) -> Result<ComposedTransaction, LedgerError>;

    #[allow(clippy::too_many_arguments)]
    async fn compose_order(
        &self,
        source: &BtcAddress,
        give_asset: &AssetName,
        give_quantity: u64,
        get_asset: &str,
        get_quantity: u64,
        expiration: u64,
        fee_rate: u64,
        inputs_set: Option<&str>,
    ) -> Result<ComposedTransaction, LedgerError>;

    async fn is_asset_transferred_to(
        &self,
        asset: &AssetName,
        to: &BtcAddress,
        from: &BtcAddress,
    ) -> Result<bool, LedgerError>;
}

pub struct HttpLedgerClient {
    http: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_envelope<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, LedgerError> {
        let endpoint = self.url(path);
        let response = self
            .http
            .get(&endpoint)
            .query(query)
            .send()
            .await
            .map_err(|source| LedgerError::Http { endpoint: endpoint.clone(), source })?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|source| LedgerError::Http { endpoint: endpoint.clone(), source })?;
        if let Some(message) = envelope.error {
            return Err(LedgerError::Api { endpoint, message });
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    #[instrument(skip(self), level = "debug")]
    async fn get_current_block(&self) -> Result<CurrentBlock, LedgerError> {
        let blocks: Vec<CurrentBlock> = self.get_envelope("/blocks", &[("limit", "1".to_string())]).await?;
        blocks.into_iter().next().ok_or_else(|| LedgerError::Api {
            endpoint: self.url("/blocks"),
            message: "empty blocks response".to_string(),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_orders_by_address(
        &self,
        address: &BtcAddress,
        status: OrderStatusFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, LedgerError> {
        self.get_envelope(
            &format!("/addresses/{}/orders", address.0),
            &[
                ("status", status.as_query_value().to_string()),
                ("show_unconfirmed", "true".to_string()),
                ("verbose", "true".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
                ("sort", "block_index:desc".to_string()),
            ],
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_order_matches(&self, order_hash: &OrderHash) -> Result<Vec<OrderMatch>, LedgerError> {
        self.get_envelope(
            &format!("/orders/{}/matches", order_hash.0),
            &[("verbose", "true".to_string()), ("show_unconfirmed", "true".to_string())],
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_asset_info(&self, asset: &AssetName) -> Result<AssetInfo, LedgerError> {
        self.get_envelope(&format!("/assets/{}", asset.0), &[]).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_asset_issuances(&self, asset: &AssetName) -> Result<Vec<AssetIssuance>, LedgerError> {
        self.get_envelope(
            &format!("/assets/{}/issuances", asset.0),
            &[("show_unconfirmed", "true".to_string()), ("limit", "100".to_string())],
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_mempool_buy_orders(&self) -> Result<Vec<MempoolOrderEvent>, LedgerError> {
        self.get_envelope("/mempool/events/OPEN_ORDER", &[("verbose", "true".to_string())]).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_mempool_transfers(&self, address: &BtcAddress) -> Result<Vec<MempoolOrderEvent>, LedgerError> {
        self.get_envelope(
            "/addresses/mempool",
            &[("addresses", address.0.clone()), ("verbose", "true".to_string())],
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_mempool_order_assets(&self, address: &BtcAddress) -> Result<Vec<AssetName>, LedgerError> {
        let events = self.get_mempool_transfers(address).await?;
        Ok(events.into_iter().map(|e| AssetName(e.give_asset)).collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_open_order_assets(&self, address: &BtcAddress) -> Result<Vec<AssetName>, LedgerError> {
        let orders = self
            .get_orders_by_address(address, OrderStatusFilter::Open, 1000, 0)
            .await?;
        Ok(orders.into_iter().filter_map(|o| o.asset()).collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_xcpfolio_balances(&self, address: &BtcAddress) -> Result<Vec<XcpfolioBalance>, LedgerError> {
        self.get_envelope(&format!("/addresses/{}/balances", address.0), &[("asset", "XCPFOLIO.*".to_string())])
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn compose_transfer(
        &self,
        source: &BtcAddress,
        asset: &AssetName,
        destination: &BtcAddress,
        fee_rate: u64,
        validate: bool,
    ) -> Result<ComposedTransaction, LedgerError> {
        self.get_envelope(
            &format!("/addresses/{}/compose/issuance", source.0),
            &[
                ("asset", asset.0.clone()),
                ("quantity", "0".to_string()),
                ("transfer_destination", destination.0.clone()),
                ("description", String::new()),
                ("validate", validate.to_string()),
                ("encoding", "auto".to_string()),
                ("fee_rate", fee_rate.to_string()),
            ],
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn compose_order(
        &self,
        source: &BtcAddress,
        give_asset: &AssetName,
        give_quantity: u64,
        get_asset: &str,
        get_quantity: u64,
        expiration: u64,
        fee_rate: u64,
        inputs_set: Option<&str>,
    ) -> Result<ComposedTransaction, LedgerError> {
        let mut query = vec![
            ("give_asset", give_asset.0.clone()),
            ("give_quantity", give_quantity.to_string()),
            ("get_asset", get_asset.to_string()),
            ("get_quantity", get_quantity.to_string()),
            ("expiration", expiration.to_string()),
            ("fee_rate", fee_rate.to_string()),
        ];
        if let Some(inputs_set) = inputs_set {
            query.push(("inputs_set", inputs_set.to_string()));
        }
        self.get_envelope(&format!("/addresses/{}/compose/order", source.0), &query).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_asset_transferred_to(
        &self,
        asset: &AssetName,
        to: &BtcAddress,
        from: &BtcAddress,
    ) -> Result<bool, LedgerError> {
        let info = self.get_asset_info(asset).await?;
        if info.owner == *to {
            return Ok(true);
        }
        if info.owner != *from {
            // Someone other than us or the intended buyer owns it now; not our
            // transfer to confirm, but also not "still ours".
            return Ok(false);
        }
        let issuances = self.get_asset_issuances(asset).await?;
        Ok(issuances.iter().any(|i| i.is_completed_transfer()))
    }
}
