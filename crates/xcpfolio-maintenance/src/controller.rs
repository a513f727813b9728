//! The expired-balance -> re-listed-order state machine (spec.md §4.2).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use xcpfolio_chain::{ChainClient, Utxo};
use xcpfolio_history::{HistoryRecord, OrderHistorySink};
use xcpfolio_ledger::LedgerClient;
use xcpfolio_notify::Notifier;
use xcpfolio_signer::{PrevOut, Signer};
use xcpfolio_state::{DistributedLock, StateError, StateStore, StateStoreExt};
use xcpfolio_types::{
    ActiveOrderEntry, AssetName, Config, FailedAssetEntry, MaintenanceEnvelope, MaintenanceResult, OrderHash,
    PriceTable, TxId,
};

use crate::classify;
use crate::constants::{
    ACTIVE_ORDER_TTL, COUNTER_ASSET, ERROR_RECHECK_DELAY, GIVE_QUANTITY, LOCK_KEY, LOCK_TTL, SATOSHIS_PER_XCP,
    STALE_UTXO_REPEAT_THRESHOLD, STATE_KEY, VERIFY_DELAY,
};

/// Read-only view for a status surface (spec.md §4.2 `getStatus`).
#[derive(Debug, Clone)]
pub struct MaintenanceStatus {
    pub is_running: bool,
    pub prices_loaded: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub active_orders: HashMap<AssetName, ActiveOrderEntry>,
    pub failed_assets: HashMap<AssetName, FailedAssetEntry>,
}

/// Reconstitutes expired DEX sell orders for `XCPFOLIO.*` subassets still
/// held, never duplicating an active listing.
pub struct MaintenanceController<S> {
    config: Config,
    ledger: Arc<dyn LedgerClient>,
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    notifier: Arc<dyn Notifier>,
    history: Arc<dyn OrderHistorySink>,
    state: Arc<S>,

    run_lock: AsyncMutex<()>,
    run_counter: AtomicU64,
    running: AtomicBool,
    stop_requested: AtomicBool,

    prices: SyncMutex<PriceTable>,
    last_envelope: SyncMutex<MaintenanceEnvelope>,
}

impl<S: StateStore> MaintenanceController<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerClient>,
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn Signer>,
        notifier: Arc<dyn Notifier>,
        history: Arc<dyn OrderHistorySink>,
        state: Arc<S>,
    ) -> Self {
        Self {
            config,
            ledger,
            chain,
            signer,
            notifier,
            history,
            state,
            run_lock: AsyncMutex::new(()),
            run_counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            prices: SyncMutex::new(PriceTable::new()),
            last_envelope: SyncMutex::new(MaintenanceEnvelope::default()),
        }
    }

    pub fn set_prices(&self, prices: PriceTable) {
        *self.prices.lock() = prices;
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn get_status(&self) -> MaintenanceStatus {
        let envelope = self.last_envelope.lock().clone();
        MaintenanceStatus {
            is_running: self.running.load(Ordering::SeqCst),
            prices_loaded: !self.prices.lock().is_empty(),
            last_run: envelope.last_run,
            active_orders: envelope.active_orders,
            failed_assets: envelope.failed_assets,
        }
    }

    pub async fn run(&self) -> eyre::Result<Vec<MaintenanceResult>> {
        let guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("maintenance run already in progress in this process, awaiting it and returning an empty result");
                let _ = self.run_lock.lock().await;
                return Ok(vec![]);
            }
        };
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_distributed().await;
        self.running.store(false, Ordering::SeqCst);
        drop(guard);
        result
    }

    /// Acquires the distributed lock (spec §4.2 "Coordination"), runs under
    /// it, and releases on every exit path regardless of outcome.
    async fn run_distributed(&self) -> eyre::Result<Vec<MaintenanceResult>> {
        let lock = DistributedLock::with_ttl(self.state.clone() as Arc<dyn StateStore>, LOCK_TTL);
        let guard = match lock.try_acquire(LOCK_KEY).await? {
            Some(guard) => guard,
            None => {
                debug!("distributed maintenance lock held by another process, skipping this run");
                return Ok(vec![]);
            }
        };

        let result = self.run_once().await;

        if let Err(error) = guard.release().await {
            warn!(%error, "failed to release maintenance distributed lock");
        }
        result
    }

    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    async fn run_once(&self) -> eyre::Result<Vec<MaintenanceResult>> {
        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst);
        tracing::Span::current().record("run_id", run_id);
        let started = std::time::Instant::now();
        let now = Utc::now();
        info!("starting maintenance run");

        let mut envelope: MaintenanceEnvelope = self.state.get_fresh(STATE_KEY).await?.unwrap_or_default();
        envelope.last_run = Some(now);
        envelope.failed_assets.clear();

        let unconfirmed = self.chain.get_unconfirmed_tx_count(&self.config.address).await?;
        if unconfirmed >= self.config.max_mempool_txs {
            warn!(unconfirmed, "mempool at capacity, skipping maintenance run");
            xcpfolio_metrics::maintenance_run_aborted("mempool_at_capacity");
            self.notifier
                .warning(&format!("maintenance: mempool at capacity ({unconfirmed}/{})", self.config.max_mempool_txs))
                .await;
            self.persist(&envelope).await?;
            return Ok(vec![]);
        }

        let min_fee_rate = self.chain.get_actual_minimum_fee_rate().await?;
        let fee_rate = min_fee_rate.ceil().max(1.0) as u64;

        let utxos = self.chain.fetch_utxos(&self.config.address).await?;
        let inputs_set = format_inputs_set(&utxos);

        let balances = self.ledger.get_xcpfolio_balances(&self.config.address).await?;

        let confirmed_open: HashSet<AssetName> =
            self.ledger.get_open_order_assets(&self.config.address).await?.into_iter().collect();
        let mempool_open = self.fetch_mempool_open_assets().await?;
        let tracked: HashSet<AssetName> = envelope
            .active_orders
            .iter()
            .filter(|(_, entry)| !is_stale(entry, now))
            .map(|(asset, _)| asset.clone())
            .collect();
        let mut already_listed = confirmed_open;
        already_listed.extend(mempool_open);
        already_listed.extend(tracked);

        let prices = self.prices.lock().clone();
        let mut to_process: Vec<(AssetName, u64)> = balances
            .into_iter()
            .filter(|b| b.quantity > 0 && !already_listed.contains(&b.asset))
            .filter_map(|b| prices.get(&b.asset).copied().filter(|&price| price > 0).map(|price| (b.asset, price)))
            .collect();
        to_process.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));

        if self.config.dry_run {
            info!(count = to_process.len(), "dry run: would re-list these assets");
            self.persist(&envelope).await?;
            return Ok(to_process
                .into_iter()
                .map(|(asset, _)| MaintenanceResult { asset, success: true, txid: None, error: None })
                .collect());
        }

        let mut results = Vec::with_capacity(to_process.len());
        let mut last_outpoint: Option<String> = None;
        let mut outpoint_repeat = 0u32;
        let mut broadcast_happened_once = false;

        for (asset, price) in to_process {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!("stop requested, ending maintenance run early");
                break;
            }

            let fresh_envelope: MaintenanceEnvelope = self.state.get_fresh(STATE_KEY).await?.unwrap_or_default();
            if fresh_envelope.active_orders.get(&asset).map(|e| !is_stale(e, Utc::now())).unwrap_or(false) {
                continue;
            }
            if self.fetch_mempool_open_assets().await?.contains(&asset) {
                continue;
            }

            envelope.active_orders.insert(
                asset.clone(),
                ActiveOrderEntry { asset: asset.clone(), txid: None, broadcast_time: Utc::now(), price },
            );
            self.persist(&envelope).await?;

            if broadcast_happened_once {
                tokio::time::sleep(self.config.wait_after_broadcast).await;
            }

            match self.list_one(&asset, price, fee_rate, &inputs_set).await {
                Ok(txid) => {
                    if let Some(entry) = envelope.active_orders.get_mut(&asset) {
                        entry.txid = Some(txid.clone());
                    }
                    self.persist(&envelope).await?;
                    broadcast_happened_once = true;
                    outpoint_repeat = 0;
                    xcpfolio_metrics::maintenance_listing(true);
                    self.notifier.success(&format!("re-listed {asset} at {price} XCP (txid {txid})")).await;
                    self.publish_history(&asset, "broadcast", Some(&txid)).await;
                    results.push(MaintenanceResult { asset, success: true, txid: Some(txid), error: None });
                }
                Err(message) => {
                    if self.recover_via_mempool(&asset).await {
                        broadcast_happened_once = true;
                        xcpfolio_metrics::maintenance_listing(true);
                        self.publish_history(&asset, "broadcast_unverified", None).await;
                        results.push(MaintenanceResult { asset, success: true, txid: None, error: None });
                        continue;
                    }

                    warn!(asset = %asset.0, %message, "maintenance listing failed, active marker retained until TTL");
                    envelope.failed_assets.insert(
                        asset.clone(),
                        FailedAssetEntry { count: 1, last_error: message.clone(), last_attempt_time: Utc::now() },
                    );
                    self.persist(&envelope).await?;
                    xcpfolio_metrics::maintenance_listing(false);
                    self.publish_history(&asset, "failed", None).await;
                    results.push(MaintenanceResult { asset: asset.clone(), success: false, txid: None, error: Some(message.clone()) });

                    if classify::is_insufficient_funds(&message) {
                        warn!("insufficient funds detected, aborting the rest of this maintenance run");
                        xcpfolio_metrics::maintenance_run_aborted("insufficient_funds");
                        self.notifier.critical(&format!("maintenance: insufficient funds, aborting run ({message})")).await;
                        break;
                    }
                    match classify::extract_outpoint(&message) {
                        Some(outpoint) if last_outpoint.as_deref() == Some(outpoint.as_str()) => {
                            outpoint_repeat += 1;
                            if outpoint_repeat >= STALE_UTXO_REPEAT_THRESHOLD {
                                warn!("recurrent stale-UTXO failure, aborting maintenance run until a prior tx confirms");
                                xcpfolio_metrics::maintenance_run_aborted("stale_utxo");
                                self.notifier.warning("maintenance: recurrent stale-UTXO failure, aborting run").await;
                                break;
                            }
                        }
                        Some(outpoint) => {
                            last_outpoint = Some(outpoint);
                            outpoint_repeat = 1;
                        }
                        None => {
                            last_outpoint = None;
                            outpoint_repeat = 0;
                        }
                    }
                }
            }
        }

        self.persist(&envelope).await?;
        xcpfolio_metrics::run_duration_seconds("maintenance", started.elapsed().as_secs_f64());
        info!(listed = results.iter().filter(|r| r.success).count(), "maintenance run complete");
        Ok(results)
    }

    /// Compose, sign, broadcast, and best-effort verify one re-listing.
    /// Returns a plain message on any failure rather than propagating via
    /// `eyre`: every failure here is the non-fatal "continue with the next
    /// asset" kind spec §7 describes, not the fatal infra kind that should
    /// stop `run()`.
    async fn list_one(&self, asset: &AssetName, price: u64, fee_rate: u64, inputs_set: &str) -> Result<TxId, String> {
        let composed = self
            .ledger
            .compose_order(
                &self.config.address,
                asset,
                GIVE_QUANTITY,
                COUNTER_ASSET,
                price.saturating_mul(SATOSHIS_PER_XCP),
                self.config.order_expiration,
                fee_rate,
                Some(inputs_set),
            )
            .await
            .map_err(|error| format!("compose failed: {}", error.message()))?;

        // Single-UTXO funding, the same simplification the fulfillment
        // controller makes: the signer needs exactly one prevout per input
        // and this build assumes the composed transaction has one input.
        let utxos = self.chain.fetch_utxos(&self.config.address).await.map_err(|error| format!("failed to fetch utxos: {error}"))?;
        let prevout =
            select_prevout(&utxos).ok_or_else(|| "no confirmed utxo available to fund listing".to_string())?;
        let signed = self
            .signer
            .sign_transaction(&composed.rawtransaction, std::slice::from_ref(&prevout))
            .await
            .map_err(|error| format!("sign failed: {error}"))?;

        let outcome = self.chain.broadcast_transaction(&signed.hex).await.map_err(|error| format!("broadcast failed: {error}"))?;
        let txid = outcome.txid().clone();

        tokio::time::sleep(VERIFY_DELAY).await;
        match self.fetch_mempool_open_assets().await {
            Ok(assets) if !assets.contains(asset) => {
                debug!(asset = %asset.0, "broadcast order not yet visible in mempool after the verification delay");
            }
            Err(error) => debug!(%error, asset = %asset.0, "failed to verify mempool visibility after broadcast"),
            _ => {}
        }
        Ok(txid)
    }

    async fn recover_via_mempool(&self, asset: &AssetName) -> bool {
        tokio::time::sleep(ERROR_RECHECK_DELAY).await;
        match self.fetch_mempool_open_assets().await {
            Ok(assets) => assets.contains(asset),
            Err(error) => {
                warn!(%error, "failed to re-check mempool after a listing failure");
                false
            }
        }
    }

    async fn fetch_mempool_open_assets(&self) -> Result<HashSet<AssetName>, xcpfolio_ledger::LedgerError> {
        let events = self.ledger.get_mempool_buy_orders().await?;
        Ok(events
            .into_iter()
            .filter(|event| event.source == self.config.address)
            .filter_map(|event| AssetName::from_xcpfolio_long_name(&event.give_asset))
            .collect())
    }

    async fn publish_history(&self, asset: &AssetName, stage: &str, txid: Option<&TxId>) {
        self.history
            .publish(HistoryRecord {
                order_hash: OrderHash(format!("maintenance:{}:{}", asset.0, Utc::now().timestamp_millis())),
                asset: asset.clone(),
                buyer: None,
                stage: stage.to_string(),
                txid: txid.cloned(),
                is_rbf: false,
                recorded_at: Utc::now(),
            })
            .await;
    }

    async fn persist(&self, envelope: &MaintenanceEnvelope) -> Result<(), StateError> {
        self.state.set(STATE_KEY, envelope, None).await?;
        *self.last_envelope.lock() = envelope.clone();
        Ok(())
    }
}

fn is_stale(entry: &ActiveOrderEntry, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(entry.broadcast_time) > chrono::Duration::from_std(ACTIVE_ORDER_TTL).unwrap_or_default()
}

fn format_inputs_set(utxos: &[Utxo]) -> String {
    utxos.iter().filter(|u| u.confirmed).map(|u| format!("{}:{}", u.txid, u.vout)).collect::<Vec<_>>().join(",")
}

fn select_prevout(utxos: &[Utxo]) -> Option<PrevOut> {
    utxos
        .iter()
        .filter(|u| u.confirmed)
        .max_by_key(|u| u.value)
        .map(|u| PrevOut { value_sats: u.value, script_pubkey_hex: u.script_pubkey_hex.clone() })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use xcpfolio_ledger::{MempoolOrderEvent, OrderStatusFilter, XcpfolioBalance};
    use xcpfolio_types::{BtcAddress, Network};
    use xcpfolio_history::NullHistorySink;
    use testing_support::{FakeChainClient, FakeLedgerClient, FakeNotifier, FakeSigner, FakeStateStore};

    use super::*;

    fn us() -> BtcAddress {
        BtcAddress::from("1usaddress")
    }

    fn test_config() -> Config {
        Config {
            address: us(),
            private_key_wif: "unused-in-tests".to_string(),
            network: Network::Mainnet,
            dry_run: false,
            max_mempool_txs: 25,
            compose_cooldown: Duration::from_secs(0),
            max_retries: 10,
            rbf_enabled: true,
            stuck_tx_threshold: 3,
            max_total_fee_sats: 10_000,
            max_fee_rate_for_new_tx: 100,
            order_expiration: 8064,
            wait_after_broadcast: Duration::from_secs(0),
            check_interval_cron: "* * * * *".to_string(),
            check_interval: Duration::from_secs(60),
            counterparty_api: String::new(),
            mempool_api: String::new(),
            blockstream_api: String::new(),
            state_store_url: String::new(),
            state_store_token: None,
            notifier_webhook: None,
            status_api_port: None,
        }
    }

    fn fund_utxo(chain: &FakeChainClient) {
        chain.set_utxos(
            &us(),
            vec![Utxo { txid: "funding".to_string(), vout: 0, value: 100_000, confirmed: true, script_pubkey_hex: "0014deadbeef".to_string() }],
        );
    }

    struct Harness {
        controller: MaintenanceController<FakeStateStore>,
        ledger: Arc<FakeLedgerClient>,
        chain: Arc<FakeChainClient>,
        notifier: Arc<FakeNotifier>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(FakeLedgerClient::new());
        let chain = Arc::new(FakeChainClient::new());
        let signer = Arc::new(FakeSigner::new());
        let notifier = Arc::new(FakeNotifier::new());
        let state = Arc::new(FakeStateStore::new());
        let controller = MaintenanceController::new(
            test_config(),
            ledger.clone(),
            chain.clone(),
            signer,
            notifier.clone(),
            Arc::new(NullHistorySink),
            state,
        );
        Harness { controller, ledger, chain, notifier }
    }

    #[tokio::test]
    async fn relists_an_unlisted_asset_with_a_configured_price() {
        let h = harness();
        h.controller.set_prices([(AssetName("RAREPEPE".to_string()), 5)].into_iter().collect());
        h.ledger.set_xcpfolio_balances(&us(), vec![XcpfolioBalance { asset: AssetName("RAREPEPE".to_string()), quantity: 1 }]);
        fund_utxo(&h.chain);

        let results = h.controller.run().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].txid.is_some());

        let status = h.controller.get_status();
        assert!(status.active_orders.contains_key(&AssetName("RAREPEPE".to_string())));
    }

    #[tokio::test]
    async fn already_listed_asset_is_skipped() {
        let h = harness();
        h.controller.set_prices([(AssetName("RAREPEPE".to_string()), 5)].into_iter().collect());
        h.ledger.set_xcpfolio_balances(&us(), vec![XcpfolioBalance { asset: AssetName("RAREPEPE".to_string()), quantity: 1 }]);
        h.ledger.set_orders(&us(), OrderStatusFilter::Open, vec![]);
        h.ledger.set_mempool_buy_orders(vec![MempoolOrderEvent {
            give_asset: "XCPFOLIO.RAREPEPE".to_string(),
            get_asset: "XCP".to_string(),
            source: us(),
            destination: None,
            tx_hash: Some("abc".to_string()),
        }]);
        fund_utxo(&h.chain);

        let results = h.controller.run().await.unwrap();
        assert!(results.is_empty());
        assert!(h.chain.broadcast_log().is_empty());
    }

    #[tokio::test]
    async fn asset_without_a_configured_price_is_left_alone() {
        let h = harness();
        h.ledger.set_xcpfolio_balances(&us(), vec![XcpfolioBalance { asset: AssetName("UNPRICED".to_string()), quantity: 1 }]);

        let results = h.controller.run().await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn mempool_at_capacity_skips_the_run() {
        let h = harness();
        h.controller.set_prices([(AssetName("RAREPEPE".to_string()), 5)].into_iter().collect());
        h.ledger.set_xcpfolio_balances(&us(), vec![XcpfolioBalance { asset: AssetName("RAREPEPE".to_string()), quantity: 1 }]);
        h.chain.set_unconfirmed_count(25);

        let results = h.controller.run().await.unwrap();
        assert!(results.is_empty());
        assert_eq!(h.notifier.count(xcpfolio_notify::Severity::Warning), 1);
    }

    #[tokio::test]
    async fn concurrent_run_returns_empty_instead_of_blocking_forever() {
        let h = harness();
        let (r1, r2) = tokio::join!(h.controller.run(), h.controller.run());
        r1.unwrap();
        r2.unwrap();
    }
}
