//! A [`LedgerClient`] fake. Every method reads from plain in-memory state
//! configured via builder-style setters, so a test can stand up exactly the
//! ledger view one of spec.md §8's end-to-end scenarios describes.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use xcpfolio_ledger::{
    AssetInfo, AssetIssuance, ComposedTransaction, CurrentBlock, LedgerClient, LedgerError, MempoolOrderEvent,
    OrderStatusFilter, XcpfolioBalance,
};
use xcpfolio_types::{AssetName, BtcAddress, Order, OrderHash, OrderMatch};

pub struct FakeLedgerClient {
    current_block: Mutex<CurrentBlock>,
    orders_by_address: Mutex<HashMap<(String, &'static str), Vec<Order>>>,
    order_matches: Mutex<HashMap<String, Vec<OrderMatch>>>,
    asset_info: Mutex<HashMap<String, AssetInfo>>,
    asset_issuances: Mutex<HashMap<String, Vec<AssetIssuance>>>,
    mempool_buy_orders: Mutex<Vec<MempoolOrderEvent>>,
    mempool_transfers: Mutex<HashMap<String, Vec<MempoolOrderEvent>>>,
    xcpfolio_balances: Mutex<HashMap<String, Vec<XcpfolioBalance>>>,
    already_transferred: Mutex<HashMap<(String, String, String), bool>>,
    compose_transfer_calls: Mutex<Vec<(String, u64, bool)>>,
    compose_order_calls: Mutex<Vec<(String, u64, u64, Option<String>)>>,
    fail_compose_transfer: Mutex<Option<String>>,
    fail_compose_order: Mutex<Option<String>>,
}

impl Default for FakeLedgerClient {
    fn default() -> Self {
        Self {
            current_block: Mutex::new(CurrentBlock { block_index: 800_000, block_time: chrono::Utc::now() }),
            orders_by_address: Mutex::new(HashMap::new()),
            order_matches: Mutex::new(HashMap::new()),
            asset_info: Mutex::new(HashMap::new()),
            asset_issuances: Mutex::new(HashMap::new()),
            mempool_buy_orders: Mutex::new(Vec::new()),
            mempool_transfers: Mutex::new(HashMap::new()),
            xcpfolio_balances: Mutex::new(HashMap::new()),
            already_transferred: Mutex::new(HashMap::new()),
            compose_transfer_calls: Mutex::new(Vec::new()),
            compose_order_calls: Mutex::new(Vec::new()),
            fail_compose_transfer: Mutex::new(None),
            fail_compose_order: Mutex::new(None),
        }
    }
}

impl FakeLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_block(&self, block_index: u64) {
        self.current_block.lock().block_index = block_index;
    }

    pub fn set_orders(&self, address: &BtcAddress, status: OrderStatusFilter, orders: Vec<Order>) {
        self.orders_by_address.lock().insert((address.0.clone(), status_key(status)), orders);
    }

    pub fn set_order_match(&self, order_hash: &OrderHash, matches: Vec<OrderMatch>) {
        self.order_matches.lock().insert(order_hash.0.clone(), matches);
    }

    pub fn set_asset_info(&self, asset: &AssetName, info: AssetInfo) {
        self.asset_info.lock().insert(asset.0.clone(), info);
    }

    pub fn set_asset_issuances(&self, asset: &AssetName, issuances: Vec<AssetIssuance>) {
        self.asset_issuances.lock().insert(asset.0.clone(), issuances);
    }

    pub fn set_mempool_buy_orders(&self, orders: Vec<MempoolOrderEvent>) {
        *self.mempool_buy_orders.lock() = orders;
    }

    pub fn set_mempool_transfers(&self, address: &BtcAddress, events: Vec<MempoolOrderEvent>) {
        self.mempool_transfers.lock().insert(address.0.clone(), events);
    }

    pub fn set_xcpfolio_balances(&self, address: &BtcAddress, balances: Vec<XcpfolioBalance>) {
        self.xcpfolio_balances.lock().insert(address.0.clone(), balances);
    }

    pub fn set_already_transferred(&self, asset: &AssetName, to: &BtcAddress, from: &BtcAddress, value: bool) {
        self.already_transferred
            .lock()
            .insert((asset.0.clone(), to.0.clone(), from.0.clone()), value);
    }

    pub fn fail_next_compose_transfer(&self, message: impl Into<String>) {
        *self.fail_compose_transfer.lock() = Some(message.into());
    }

    pub fn fail_next_compose_order(&self, message: impl Into<String>) {
        *self.fail_compose_order.lock() = Some(message.into());
    }

    pub fn compose_transfer_calls(&self) -> Vec<(String, u64, bool)> {
        self.compose_transfer_calls.lock().clone()
    }

    pub fn compose_order_calls(&self) -> Vec<(String, u64, u64, Option<String>)> {
        self.compose_order_calls.lock().clone()
    }
}

fn status_key(status: OrderStatusFilter) -> &'static str {
    match status {
        OrderStatusFilter::Filled => "filled",
        OrderStatusFilter::Open => "open",
    }
}

#[async_trait]
impl LedgerClient for FakeLedgerClient {
    async fn get_current_block(&self) -> Result<CurrentBlock, LedgerError> {
        Ok(self.current_block.lock().clone())
    }

    async fn get_orders_by_address(
        &self,
        address: &BtcAddress,
        status: OrderStatusFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, LedgerError> {
        let all = self
            .orders_by_address
            .lock()
            .get(&(address.0.clone(), status_key(status)))
            .cloned()
            .unwrap_or_default();
        let offset = offset as usize;
        let limit = limit as usize;
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_order_matches(&self, order_hash: &OrderHash) -> Result<Vec<OrderMatch>, LedgerError> {
        Ok(self.order_matches.lock().get(&order_hash.0).cloned().unwrap_or_default())
    }

    async fn get_asset_info(&self, asset: &AssetName) -> Result<AssetInfo, LedgerError> {
        self.asset_info.lock().get(&asset.0).cloned().ok_or_else(|| LedgerError::Api {
            endpoint: format!("/assets/{}", asset.0),
            message: "unknown asset".to_string(),
        })
    }

    async fn get_asset_issuances(&self, asset: &AssetName) -> Result<Vec<AssetIssuance>, LedgerError> {
        Ok(self.asset_issuances.lock().get(&asset.0).cloned().unwrap_or_default())
    }

    async fn get_mempool_buy_orders(&self) -> Result<Vec<MempoolOrderEvent>, LedgerError> {
        Ok(self.mempool_buy_orders.lock().clone())
    }

    async fn get_mempool_transfers(&self, address: &BtcAddress) -> Result<Vec<MempoolOrderEvent>, LedgerError> {
        Ok(self.mempool_transfers.lock().get(&address.0).cloned().unwrap_or_default())
    }

    async fn get_mempool_order_assets(&self, address: &BtcAddress) -> Result<Vec<AssetName>, LedgerError> {
        Ok(self
            .get_mempool_transfers(address)
            .await?
            .into_iter()
            .map(|e| AssetName(e.give_asset))
            .collect())
    }

    async fn get_open_order_assets(&self, address: &BtcAddress) -> Result<Vec<AssetName>, LedgerError> {
        Ok(self
            .get_orders_by_address(address, OrderStatusFilter::Open, 1000, 0)
            .await?
            .into_iter()
            .filter_map(|o| o.asset())
            .collect())
    }

    async fn get_xcpfolio_balances(&self, address: &BtcAddress) -> Result<Vec<XcpfolioBalance>, LedgerError> {
        Ok(self.xcpfolio_balances.lock().get(&address.0).cloned().unwrap_or_default())
    }

    async fn compose_transfer(
        &self,
        _source: &BtcAddress,
        asset: &AssetName,
        _destination: &BtcAddress,
        fee_rate: u64,
        validate: bool,
    ) -> Result<ComposedTransaction, LedgerError> {
        if let Some(message) = self.fail_compose_transfer.lock().take() {
            return Err(LedgerError::Api { endpoint: "/compose/issuance".to_string(), message });
        }
        self.compose_transfer_calls.lock().push((asset.0.clone(), fee_rate, validate));
        Ok(ComposedTransaction { rawtransaction: format!("unsigned:{}:{}", asset.0, fee_rate) })
    }

    async fn compose_order(
        &self,
        _source: &BtcAddress,
        give_asset: &AssetName,
        give_quantity: u64,
        _get_asset: &str,
        get_quantity: u64,
        _expiration: u64,
        fee_rate: u64,
        inputs_set: Option<&str>,
    ) -> Result<ComposedTransaction, LedgerError> {
        if let Some(message) = self.fail_compose_order.lock().take() {
            return Err(LedgerError::Api { endpoint: "/compose/order".to_string(), message });
        }
        self.compose_order_calls
            .lock()
            .push((give_asset.0.clone(), give_quantity, get_quantity, inputs_set.map(str::to_string)));
        Ok(ComposedTransaction { rawtransaction: format!("unsigned-order:{}:{}", give_asset.0, fee_rate) })
    }

    async fn is_asset_transferred_to(
        &self,
        asset: &AssetName,
        to: &BtcAddress,
        from: &BtcAddress,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .already_transferred
            .lock()
            .get(&(asset.0.clone(), to.0.clone(), from.0.clone()))
            .copied()
            .unwrap_or(false))
    }
}
