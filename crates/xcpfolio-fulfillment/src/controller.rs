//! The order -> asset-transfer state machine (spec.md §4.1).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use xcpfolio_chain::ChainClient;
use xcpfolio_history::{HistoryRecord, OrderHistorySink};
use xcpfolio_ledger::{LedgerClient, OrderStatusFilter};
use xcpfolio_notify::Notifier;
use xcpfolio_signer::{PrevOut, Signer};
use xcpfolio_state::{StateStore, StateStoreExt};
use xcpfolio_types::{
    should_back_off, AssetName, AssetTransfer, BtcAddress, Config, FailureRecord, FulfillmentEnvelope, Order,
    OrderHash, OrderStatus, ProcessOrderResult, Stage, TxId, ALERT_THRESHOLDS,
};

use crate::constants::{
    CLEANUP_INTERVAL_BLOCKS, CLEANUP_KEEP, CONSECUTIVE_ALREADY_PROCESSED_STOP, ENVELOPE_TTL,
    ESTIMATED_VSIZE_TRANSFER, ORDERS_PAGE_SIZE, PROTECTIVE_FEE_RATE_CAP, STATE_KEY,
};

/// Read-only view of the controller's in-process and last-persisted state,
/// for a status surface to expose (spec.md §4.1 "getState").
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub is_running: bool,
    pub active_transactions: Vec<AssetTransfer>,
    pub failure_counts: HashMap<OrderHash, u32>,
    pub last_block: u64,
    pub last_checked: chrono::DateTime<Utc>,
}

/// For each newly observed filled `XCPFOLIO.<asset>` order, causes exactly
/// one asset-transfer transaction to reach a confirmed state, under a
/// per-transaction fee ceiling and a global unconfirmed-transaction budget.
///
/// Generic over the state-store backend because [`StateStoreExt`]'s typed
/// `get`/`set` helpers require `Self: Sized` and therefore cannot be called
/// through `Arc<dyn StateStore>`; every other collaborator is held as a
/// trait object since their contracts are fully captured by their traits.
pub struct FulfillmentController<S> {
    config: Config,
    ledger: Arc<dyn LedgerClient>,
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    notifier: Arc<dyn Notifier>,
    history: Arc<dyn OrderHistorySink>,
    state: Arc<S>,

    /// Guards re-entrancy: `process()` holds this for the duration of one
    /// run. A second concurrent caller fails `try_lock`, awaits the held
    /// guard, and returns an empty list once it releases (spec.md §4.1
    /// "Re-entrancy policy").
    run_lock: AsyncMutex<()>,
    run_counter: AtomicU64,
    running: AtomicBool,
    stop_requested: AtomicBool,

    active: SyncMutex<HashMap<OrderHash, AssetTransfer>>,
    last_compose_at: SyncMutex<Option<chrono::DateTime<Utc>>>,
    last_envelope: SyncMutex<FulfillmentEnvelope>,
}

impl<S: StateStore> FulfillmentController<S> {
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
            active: SyncMutex::new(HashMap::new()),
            last_compose_at: SyncMutex::new(None),
            last_envelope: SyncMutex::new(FulfillmentEnvelope::default()),
        }
    }

    /// Cooperative shutdown flag, honored between orders and before
    /// composing within an order (spec.md §5 "Cancellation and timeouts").
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn get_state(&self) -> Snapshot {
        let active_transactions = self.active.lock().values().cloned().collect();
        let envelope = self.last_envelope.lock().clone();
        Snapshot {
            is_running: self.running.load(Ordering::SeqCst),
            active_transactions,
            failure_counts: envelope.failed_orders.iter().map(|(h, r)| (h.clone(), r.count)).collect(),
            last_block: envelope.last_block,
            last_checked: envelope.last_checked,
        }
    }

    /// Single entry point. Returns a per-order outcome list.
    pub async fn process(&self) -> eyre::Result<Vec<ProcessOrderResult>> {
        let guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("fulfillment run already in progress, awaiting it and returning an empty result");
                let _ = self.run_lock.lock().await;
                return Ok(vec![]);
            }
        };
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_once().await;
        self.running.store(false, Ordering::SeqCst);
        drop(guard);
        result
    }

    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    async fn run_once(&self) -> eyre::Result<Vec<ProcessOrderResult>> {
        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst);
        tracing::Span::current().record("run_id", run_id);
        let started = std::time::Instant::now();
        info!("starting fulfillment run");

        // Step 1.
        let unconfirmed = self.chain.get_unconfirmed_tx_count(&self.config.address).await?;
        if unconfirmed >= self.config.max_mempool_txs {
            warn!(unconfirmed, max_mempool_txs = self.config.max_mempool_txs, "mempool at capacity, skipping run");
            self.notifier
                .warning(&format!(
                    "fulfillment: mempool at capacity ({unconfirmed}/{})",
                    self.config.max_mempool_txs
                ))
                .await;
            return Ok(vec![]);
        }

        // Step 2.
        let pending_transfers = self.ledger.get_mempool_transfers(&self.config.address).await?;
        let pending_keys: HashSet<(AssetName, BtcAddress)> = pending_transfers
            .into_iter()
            .filter_map(|event| event.destination.map(|dest| (AssetName(event.give_asset), dest)))
            .collect();

        // Step 4 (fetched ahead of step 3 since the cleanup check needs it).
        let current_block = self.chain.get_current_block_height().await?;

        // Step 3.
        let mut envelope: FulfillmentEnvelope = self.state.get_fresh(STATE_KEY).await?.unwrap_or_default();
        if current_block.saturating_sub(envelope.last_cleanup) >= CLEANUP_INTERVAL_BLOCKS {
            debug!(current_block, last_cleanup = envelope.last_cleanup, "running periodic processed-order cleanup");
            envelope.truncate_processed(CLEANUP_KEEP);
            envelope.last_cleanup = current_block;
        }

        // Step 5.
        if let Err(error) = self.publish_open_order_visibility().await {
            warn!(%error, "failed to fetch mempool buy orders for history visibility pass");
        }

        // Step 6.
        let mut orders: Vec<Order> = Vec::new();
        let mut offset = 0u32;
        loop {
            let page = self
                .ledger
                .get_orders_by_address(&self.config.address, OrderStatusFilter::Filled, ORDERS_PAGE_SIZE, offset)
                .await?;
            let page_len = page.len() as u32;
            orders.extend(page);
            if page_len < ORDERS_PAGE_SIZE {
                break;
            }
            offset += ORDERS_PAGE_SIZE;
        }
        let first_order_hash = orders.first().map(|o| o.order_hash.clone());

        // Steps 7-8: walk newest-first, short-circuit on a run of
        // already-processed orders. The "resolve buyer, check if already
        // delivered" half of step 8 is folded into `process_order`'s Stage 2
        // duplicate guard below rather than duplicated here, since both ask
        // the identical question (is this order already fulfilled?).
        let mut to_process = Vec::new();
        let mut consecutive_processed = 0u32;
        for order in orders {
            if envelope.is_processed(&order.order_hash) {
                consecutive_processed += 1;
                if consecutive_processed >= CONSECUTIVE_ALREADY_PROCESSED_STOP {
                    debug!("stopping order scan after a run of already-processed orders");
                    break;
                }
                continue;
            }
            consecutive_processed = 0;
            to_process.push(order);
        }

        // Steps 9-10.
        let mut results = Vec::with_capacity(to_process.len());
        for order in to_process {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!("stop requested, ending run before processing remaining orders");
                break;
            }
            let unconfirmed = self.chain.get_unconfirmed_tx_count(&self.config.address).await?;
            if unconfirmed >= self.config.max_mempool_txs {
                info!(unconfirmed, "mempool reached capacity mid-run, deferring remaining orders");
                break;
            }
            let result = self.process_order(&order, current_block, &pending_keys, &mut envelope).await;
            info!(
                order_hash = %result.order_hash.0,
                success = result.success,
                stage = %result.stage,
                "order processed"
            );
            results.push(result);
        }

        self.reconcile_mempool().await?;
        self.detect_stuck(current_block);
        if self.config.rbf_enabled {
            self.attempt_rbf(current_block).await?;
        }

        // Step 11.
        envelope.last_block = current_block;
        if let Some(hash) = first_order_hash {
            envelope.last_order_hash = Some(hash);
        }
        envelope.last_checked = Utc::now();
        self.state.set(STATE_KEY, &envelope, Some(ENVELOPE_TTL)).await?;
        *self.last_envelope.lock() = envelope;

        xcpfolio_metrics::active_transactions(self.active.lock().len() as u64);
        xcpfolio_metrics::run_duration_seconds("fulfillment", started.elapsed().as_secs_f64());
        info!(orders_processed = results.len(), "fulfillment run complete");
        Ok(results)
    }

    async fn publish_open_order_visibility(&self) -> Result<(), xcpfolio_ledger::LedgerError> {
        let open_orders = self.ledger.get_mempool_buy_orders().await?;
        for event in open_orders {
            let Some(asset) = AssetName::from_xcpfolio_long_name(&event.give_asset) else {
                continue;
            };
            let synthetic_hash = event
                .tx_hash
                .clone()
                .unwrap_or_else(|| format!("mempool-order:{}:{}", event.give_asset, event.source.0));
            self.publish_history(&OrderHash(synthetic_hash), &asset, None, "open_order_seen", None, false)
                .await;
        }
        Ok(())
    }

    /// The transfer pipeline for one order (spec.md §4.1 `processOrder`).
    /// Internal errors from per-order network calls are captured into the
    /// pre-broadcast failure tracker and returned as a failed `Result`
    /// rather than propagated, matching spec §7's taxonomy: only the
    /// top-level orchestration calls in `run_once` are fatal.
    async fn process_order(
        &self,
        order: &Order,
        current_block: u64,
        pending_keys: &HashSet<(AssetName, BtcAddress)>,
        envelope: &mut FulfillmentEnvelope,
    ) -> ProcessOrderResult {
        let order_hash = order.order_hash.clone();

        let matches = match self.ledger.get_order_matches(&order_hash).await {
            Ok(m) => m,
            Err(error) => {
                return self
                    .fail_validation(order, None, format!("failed to fetch order matches: {}", error.message()), envelope)
                    .await
            }
        };
        let buyer = match matches.iter().find_map(|m| m.buyer(&self.config.address)) {
            Some(b) => b,
            None => {
                return self
                    .fail_validation(order, None, "no order-match record found for filled order", envelope)
                    .await
            }
        };

        // Stage 1: validate.
        let asset = match order.asset() {
            Some(asset) => asset,
            None => {
                return self
                    .fail_validation(
                        order,
                        Some(buyer),
                        format!("give-asset {} is not namespaced under XCPFOLIO.", order.give_asset_long_name),
                        envelope,
                    )
                    .await
            }
        };
        if order.status != OrderStatus::Filled {
            return self
                .fail_validation(order, Some(buyer), format!("order status is {:?}, expected filled", order.status), envelope)
                .await;
        }
        let asset_info = match self.ledger.get_asset_info(&asset).await {
            Ok(info) => info,
            Err(error) => {
                return self
                    .fail_validation(order, Some(buyer), format!("failed to fetch asset info: {}", error.message()), envelope)
                    .await
            }
        };
        if asset_info.locked {
            return self.fail_validation(order, Some(buyer), format!("asset {asset} is locked"), envelope).await;
        }
        if asset_info.owner != self.config.address {
            return self
                .fail_validation(
                    order,
                    Some(buyer),
                    format!("asset {asset} is not owned by us (owner {})", asset_info.owner),
                    envelope,
                )
                .await;
        }

        // Stage 2: duplicate guard.
        if let Some(active) = self.active.lock().get(&order_hash).cloned() {
            return ProcessOrderResult::success(order_hash, asset, buyer, Stage::Broadcast, active.current_txid().clone());
        }
        if pending_keys.contains(&(asset.clone(), buyer.clone())) {
            envelope.mark_processed(order_hash.clone());
            self.publish_history(&order_hash, &asset, Some(&buyer), "confirmed", None, false).await;
            xcpfolio_metrics::order_processed(stage_metric_label(Stage::Confirmed), true);
            return ProcessOrderResult {
                order_hash,
                asset,
                buyer: Some(buyer),
                success: true,
                stage: Stage::Confirmed,
                txid: None,
                error: None,
                is_rbf: false,
            };
        }
        match self.ledger.is_asset_transferred_to(&asset, &buyer, &self.config.address).await {
            Ok(true) => {
                envelope.mark_processed(order_hash.clone());
                let txid = self.find_transfer_txid(&asset).await;
                self.publish_history(&order_hash, &asset, Some(&buyer), "confirmed", txid.as_ref(), false).await;
                xcpfolio_metrics::order_processed(stage_metric_label(Stage::Confirmed), true);
                return ProcessOrderResult {
                    order_hash,
                    asset,
                    buyer: Some(buyer),
                    success: true,
                    stage: Stage::Confirmed,
                    txid,
                    error: None,
                    is_rbf: false,
                };
            }
            Ok(false) => {}
            Err(error) => {
                return self
                    .fail_validation(
                        order,
                        Some(buyer),
                        format!("failed to check transfer status: {}", error.message()),
                        envelope,
                    )
                    .await
            }
        }

        // Stage 3: progressive retry gate.
        let now = Utc::now();
        if let Some(record) = envelope.failed_orders.get(&order_hash).cloned() {
            if record.is_stale(now) {
                envelope.failed_orders.remove(&order_hash);
            } else if should_back_off(&record, now) {
                return ProcessOrderResult::failure(
                    order_hash,
                    asset,
                    Some(buyer),
                    Stage::Backoff,
                    format!("backing off after {} consecutive failures", record.count),
                );
            } else if ALERT_THRESHOLDS.contains(&record.count) {
                self.notifier
                    .critical(&format!(
                        "order {order_hash}: {} consecutive pre-broadcast failures (last error: {})",
                        record.count, record.last_error
                    ))
                    .await;
            }
        }

        // Cooldown: enforce a global compose cooldown across any order.
        let wait = {
            let last_compose = *self.last_compose_at.lock();
            last_compose.and_then(|last| {
                let elapsed = Utc::now().signed_duration_since(last).to_std().unwrap_or_default();
                self.config.compose_cooldown.checked_sub(elapsed)
            })
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            return ProcessOrderResult::failure(order_hash, asset, Some(buyer), Stage::Backoff, "stop requested before compose");
        }

        // Dry-run short-circuit.
        if self.config.dry_run {
            self.publish_history(&order_hash, &asset, Some(&buyer), "dry_run", None, false).await;
            return ProcessOrderResult::success(order_hash, asset, buyer, Stage::DryRun, TxId("dry-run".to_string()));
        }

        // Stage 4: compose.
        let market_rate = match self.chain.get_optimal_fee_rate().await {
            Ok(rate) => rate,
            Err(error) => {
                return self
                    .fail_pipeline(order_hash, asset, Some(buyer), Stage::Compose, format!("failed to fetch fee rate: {error}"), envelope)
                    .await
            }
        };
        if market_rate > self.config.max_fee_rate_for_new_tx {
            return self
                .fail_pipeline(
                    order_hash,
                    asset,
                    Some(buyer),
                    Stage::Compose,
                    format!("Fee rate too high: {market_rate} sat/vB exceeds maximum {}", self.config.max_fee_rate_for_new_tx),
                    envelope,
                )
                .await;
        }
        let mut fee_rate = market_rate;
        if fee_rate.saturating_mul(ESTIMATED_VSIZE_TRANSFER) > self.config.max_total_fee_sats {
            fee_rate = self.config.max_total_fee_sats / ESTIMATED_VSIZE_TRANSFER;
        }

        *self.last_compose_at.lock() = Some(Utc::now());
        let composed = match self.ledger.compose_transfer(&self.config.address, &asset, &buyer, fee_rate, true).await {
            Ok(tx) => tx,
            Err(error) => {
                return self
                    .fail_pipeline(order_hash, asset, Some(buyer), Stage::Compose, format!("compose failed: {}", error.message()), envelope)
                    .await
            }
        };

        // Stage 5: sign.
        let utxos = match self.chain.fetch_utxos(&self.config.address).await {
            Ok(u) => u,
            Err(error) => {
                return self
                    .fail_pipeline(order_hash, asset, Some(buyer), Stage::Sign, format!("failed to fetch utxos: {error}"), envelope)
                    .await
            }
        };
        let prevout = match select_prevout(&utxos) {
            Some(p) => p,
            None => {
                return self
                    .fail_pipeline(
                        order_hash,
                        asset,
                        Some(buyer),
                        Stage::Sign,
                        "no confirmed utxo available to fund transfer",
                        envelope,
                    )
                    .await
            }
        };
        let signed = match self.signer.sign_transaction(&composed.rawtransaction, std::slice::from_ref(&prevout)).await {
            Ok(s) => s,
            Err(error) => {
                return self
                    .fail_pipeline(order_hash, asset, Some(buyer), Stage::Sign, format!("sign failed: {error}"), envelope)
                    .await
            }
        };
        if signed.fee_sats > self.config.max_total_fee_sats {
            return self
                .fail_pipeline(
                    order_hash,
                    asset,
                    Some(buyer),
                    Stage::Sign,
                    format!("signed fee {} exceeds maximum {}", signed.fee_sats, self.config.max_total_fee_sats),
                    envelope,
                )
                .await;
        }

        // Stage 6: broadcast.
        let unconfirmed = match self.chain.get_unconfirmed_tx_count(&self.config.address).await {
            Ok(c) => c,
            Err(error) => {
                return self
                    .fail_pipeline(
                        order_hash,
                        asset,
                        Some(buyer),
                        Stage::Broadcast,
                        format!("failed to re-check mempool capacity: {error}"),
                        envelope,
                    )
                    .await
            }
        };
        if unconfirmed >= self.config.max_mempool_txs {
            return self
                .fail_pipeline(order_hash, asset, Some(buyer), Stage::Broadcast, "mempool at capacity before broadcast", envelope)
                .await;
        }
        let outcome = match self.chain.broadcast_transaction(&signed.hex).await {
            Ok(o) => o,
            Err(error) => {
                return self
                    .fail_pipeline(order_hash, asset, Some(buyer), Stage::Broadcast, format!("broadcast failed: {error}"), envelope)
                    .await
            }
        };
        let txid = outcome.txid().clone();

        let transfer =
            AssetTransfer::new(order_hash.clone(), asset.clone(), buyer.clone(), txid.clone(), Utc::now(), current_block, fee_rate);
        self.active.lock().insert(order_hash.clone(), transfer);
        envelope.mark_processed(order_hash.clone());
        envelope.failed_orders.remove(&order_hash);

        xcpfolio_metrics::broadcast_sent(false);
        xcpfolio_metrics::order_processed(stage_metric_label(Stage::Broadcast), true);
        self.publish_history(&order_hash, &asset, Some(&buyer), "broadcast", Some(&txid), false).await;
        self.notifier
            .success(&format!("order {order_hash}: broadcast transfer of {asset} to {buyer} (txid {txid})"))
            .await;

        ProcessOrderResult::success(order_hash, asset, buyer, Stage::Broadcast, txid)
    }

    async fn fail_validation(
        &self,
        order: &Order,
        buyer: Option<BtcAddress>,
        error: impl Into<String>,
        envelope: &mut FulfillmentEnvelope,
    ) -> ProcessOrderResult {
        let asset = order.asset().unwrap_or_else(|| AssetName(order.give_asset_long_name.clone()));
        self.fail_pipeline(order.order_hash.clone(), asset, buyer, Stage::Validation, error, envelope).await
    }

    async fn fail_pipeline(
        &self,
        order_hash: OrderHash,
        asset: AssetName,
        buyer: Option<BtcAddress>,
        stage: Stage,
        error: impl Into<String>,
        envelope: &mut FulfillmentEnvelope,
    ) -> ProcessOrderResult {
        let error = error.into();
        warn!(order_hash = %order_hash.0, %stage, %error, "order pipeline failure");
        let now = Utc::now();
        envelope
            .failed_orders
            .entry(order_hash.clone())
            .and_modify(|record| record.record_another(stage, error.clone(), now))
            .or_insert_with(|| FailureRecord::first(stage, error.clone(), now));
        xcpfolio_metrics::order_processed(stage_metric_label(stage), false);
        self.publish_history(&order_hash, &asset, buyer.as_ref(), &format!("failed_{stage}"), None, false).await;
        ProcessOrderResult::failure(order_hash, asset, buyer, stage, error)
    }

    async fn find_transfer_txid(&self, asset: &AssetName) -> Option<TxId> {
        match self.ledger.get_asset_issuances(asset).await {
            Ok(issuances) => issuances.into_iter().find(|i| i.is_completed_transfer()).map(|i| TxId(i.tx_hash)),
            Err(error) => {
                warn!(%error, asset = %asset.0, "failed to look up transfer txid for display");
                None
            }
        }
    }

    async fn publish_history(
        &self,
        order_hash: &OrderHash,
        asset: &AssetName,
        buyer: Option<&BtcAddress>,
        stage: &str,
        txid: Option<&TxId>,
        is_rbf: bool,
    ) {
        self.history
            .publish(HistoryRecord {
                order_hash: order_hash.clone(),
                asset: asset.clone(),
                buyer: buyer.cloned(),
                stage: stage.to_string(),
                txid: txid.cloned(),
                is_rbf,
                recorded_at: Utc::now(),
            })
            .await;
    }

    /// Mempool-state reconciliation (spec.md §4.1 "Mempool-state
    /// reconciliation").
    async fn reconcile_mempool(&self) -> eyre::Result<()> {
        let snapshot: Vec<AssetTransfer> = self.active.lock().values().cloned().collect();
        for transfer in snapshot {
            if let Some(tx) = self.chain.get_transaction(transfer.current_txid()).await? {
                if tx.status.confirmed {
                    self.finish_confirmed(&transfer, transfer.current_txid().clone()).await;
                    continue;
                }
            }
            let in_mempool = self.chain.is_in_mempool(transfer.current_txid()).await?;
            if in_mempool {
                continue;
            }
            let mut confirmed_txid = None;
            for txid in transfer.all_txids() {
                if let Some(tx) = self.chain.get_transaction(txid).await? {
                    if tx.status.confirmed {
                        confirmed_txid = Some(txid.clone());
                        break;
                    }
                }
            }
            if let Some(txid) = confirmed_txid {
                self.finish_confirmed(&transfer, txid).await;
            } else {
                warn!(
                    order_hash = %transfer.order_hash.0,
                    txid = %transfer.current_txid(),
                    "active transaction dropped from mempool, flagging for RBF"
                );
                if let Some(active) = self.active.lock().get_mut(&transfer.order_hash) {
                    active.mark_dropped_from_mempool();
                }
            }
        }
        Ok(())
    }

    async fn finish_confirmed(&self, transfer: &AssetTransfer, txid: TxId) {
        info!(order_hash = %transfer.order_hash.0, %txid, "transfer confirmed");
        self.active.lock().remove(&transfer.order_hash);
        self.notifier.success(&format!("order {}: transfer confirmed (txid {txid})", transfer.order_hash)).await;
        self.publish_history(&transfer.order_hash, &transfer.asset, Some(&transfer.buyer), "confirmed", Some(&txid), false)
            .await;
    }

    /// Stuck detection (spec.md §4.1 "Stuck detection").
    fn detect_stuck(&self, current_block: u64) {
        let mut active = self.active.lock();
        for transfer in active.values_mut() {
            if !transfer.needs_rbf() && current_block.saturating_sub(transfer.broadcast_block) >= self.config.stuck_tx_threshold {
                debug!(order_hash = %transfer.order_hash.0, "transaction stuck, flagging for RBF");
                transfer.mark_needs_rbf();
            }
        }
    }

    /// RBF escalation (spec.md §4.1 "RBF escalation (`attemptRBF`)").
    async fn attempt_rbf(&self, current_block: u64) -> eyre::Result<()> {
        let candidates: Vec<AssetTransfer> = self
            .active
            .lock()
            .values()
            .filter(|t| t.needs_rbf() || t.dropped_from_mempool())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let market_rate = self.chain.get_optimal_fee_rate().await?;
        for transfer in candidates {
            self.attempt_rbf_one(&transfer, current_block, market_rate).await;
        }
        Ok(())
    }

    async fn attempt_rbf_one(&self, transfer: &AssetTransfer, current_block: u64, market_rate: u64) {
        let blocks_since = current_block.saturating_sub(transfer.broadcast_block);
        let escalated = if blocks_since < 12 {
            ((transfer.fee_rate as f64 * 1.5).ceil() as u64).max(market_rate)
        } else if blocks_since < 24 {
            ((transfer.fee_rate as f64 * 2.0).ceil() as u64).max((market_rate as f64 * 1.1).ceil() as u64)
        } else {
            (market_rate as f64 * 1.5).ceil() as u64
        };
        let mut new_rate = escalated.max(transfer.fee_rate + 1);

        if new_rate.saturating_mul(ESTIMATED_VSIZE_TRANSFER) > self.config.max_total_fee_sats {
            new_rate = self.config.max_total_fee_sats / ESTIMATED_VSIZE_TRANSFER;
            if new_rate <= transfer.fee_rate {
                warn!(order_hash = %transfer.order_hash.0, "cannot RBF within the fee ceiling, abandoning the active transaction");
                xcpfolio_metrics::rbf_abandoned();
                self.notifier
                    .warning(&format!(
                        "order {}: abandoning stuck transfer, RBF would exceed the fee ceiling",
                        transfer.order_hash
                    ))
                    .await;
                self.active.lock().remove(&transfer.order_hash);
                return;
            }
        }
        new_rate = new_rate.min(PROTECTIVE_FEE_RATE_CAP);

        let composed = match self.ledger.compose_transfer(&self.config.address, &transfer.asset, &transfer.buyer, new_rate, false).await {
            Ok(c) => c,
            Err(error) => {
                warn!(order_hash = %transfer.order_hash.0, %error, "RBF compose failed, dropping record for the next run to recompose");
                self.active.lock().remove(&transfer.order_hash);
                return;
            }
        };
        let utxos = match self.chain.fetch_utxos(&self.config.address).await {
            Ok(u) => u,
            Err(error) => {
                warn!(order_hash = %transfer.order_hash.0, %error, "RBF: failed to fetch utxos, dropping record");
                self.active.lock().remove(&transfer.order_hash);
                return;
            }
        };
        let prevout = match select_prevout(&utxos) {
            Some(p) => p,
            None => {
                warn!(order_hash = %transfer.order_hash.0, "RBF: no confirmed utxo available, dropping record");
                self.active.lock().remove(&transfer.order_hash);
                return;
            }
        };
        let signed = match self.signer.sign_transaction(&composed.rawtransaction, std::slice::from_ref(&prevout)).await {
            Ok(s) => s,
            Err(error) => {
                warn!(order_hash = %transfer.order_hash.0, %error, "RBF sign failed, dropping record for the next run to recompose");
                self.active.lock().remove(&transfer.order_hash);
                return;
            }
        };
        if signed.fee_sats > self.config.max_total_fee_sats {
            warn!(
                order_hash = %transfer.order_hash.0,
                fee_sats = signed.fee_sats,
                ceiling = self.config.max_total_fee_sats,
                "RBF signed fee exceeds the ceiling, aborting without broadcasting"
            );
            return;
        }

        match self.chain.broadcast_transaction(&signed.hex).await {
            Ok(outcome) => {
                let new_txid = outcome.txid().clone();
                if let Some(active) = self.active.lock().get_mut(&transfer.order_hash) {
                    active.push_rbf_txid(new_txid.clone(), new_rate, current_block);
                }
                xcpfolio_metrics::rbf_escalation();
                xcpfolio_metrics::broadcast_sent(true);
                info!(order_hash = %transfer.order_hash.0, new_fee_rate = new_rate, txid = %new_txid, "RBF broadcast succeeded");
                self.publish_history(&transfer.order_hash, &transfer.asset, Some(&transfer.buyer), "rbf_broadcast", Some(&new_txid), true)
                    .await;
            }
            Err(error) => {
                warn!(order_hash = %transfer.order_hash.0, %error, "RBF broadcast failed, dropping record for the next run to recompose");
                self.active.lock().remove(&transfer.order_hash);
            }
        }
    }
}

/// Picks the highest-value confirmed UTXO to fund a single-input transfer
/// transaction. This build assumes one UTXO suffices per transfer (the
/// common case for this bot's transaction shape); full multi-input
/// selection and change handling are left to the ledger's compose step,
/// which already returns a complete unsigned transaction — the signer only
/// needs prevout data for the inputs that transaction actually has.
fn select_prevout(utxos: &[xcpfolio_chain::Utxo]) -> Option<PrevOut> {
    utxos
        .iter()
        .filter(|u| u.confirmed)
        .max_by_key(|u| u.value)
        .map(|u| PrevOut { value_sats: u.value, script_pubkey_hex: u.script_pubkey_hex.clone() })
}

fn stage_metric_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Validation => "validation",
        Stage::Compose => "compose",
        Stage::Sign => "sign",
        Stage::Broadcast => "broadcast",
        Stage::Confirmed => "confirmed",
        Stage::Backoff => "backoff",
        Stage::DryRun => "dry_run",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use xcpfolio_chain::Utxo;
    use xcpfolio_ledger::AssetInfo;
    use xcpfolio_types::{Network, OrderMatch};
    use xcpfolio_history::NullHistorySink;
    use testing_support::{BroadcastBehavior, FakeChainClient, FakeLedgerClient, FakeNotifier, FakeSigner, FakeStateStore};

    use super::*;

    fn us() -> BtcAddress {
        BtcAddress::from("1usaddress")
    }

    fn buyer() -> BtcAddress {
        BtcAddress::from("1buyeraddress")
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

    fn sample_order(hash: &str) -> Order {
        Order {
            order_hash: OrderHash(hash.to_string()),
            block_index: 800_000,
            block_time: Utc::now(),
            status: OrderStatus::Filled,
            give_asset_long_name: "XCPFOLIO.RAREPEPE".to_string(),
            get_quantity: 500_000_000,
        }
    }

    fn unlocked_asset_info() -> AssetInfo {
        AssetInfo { asset: "RAREPEPE".to_string(), owner: us(), locked: false, supply: 1 }
    }

    fn fund_utxo(chain: &FakeChainClient) {
        chain.set_utxos(
            &us(),
            vec![Utxo { txid: "funding".to_string(), vout: 0, value: 100_000, confirmed: true, script_pubkey_hex: "0014deadbeef".to_string() }],
        );
    }

    struct Harness {
        controller: FulfillmentController<FakeStateStore>,
        ledger: Arc<FakeLedgerClient>,
        chain: Arc<FakeChainClient>,
        signer: Arc<FakeSigner>,
        notifier: Arc<FakeNotifier>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(FakeLedgerClient::new());
        let chain = Arc::new(FakeChainClient::new());
        let signer = Arc::new(FakeSigner::new());
        let notifier = Arc::new(FakeNotifier::new());
        let state = Arc::new(FakeStateStore::new());
        let controller = FulfillmentController::new(
            test_config(),
            ledger.clone(),
            chain.clone(),
            signer.clone(),
            notifier.clone(),
            Arc::new(NullHistorySink),
            state,
        );
        Harness { controller, ledger, chain, signer, notifier }
    }

    #[tokio::test]
    async fn happy_path_broadcasts_a_transfer() {
        let h = harness();
        let order = sample_order("order1");
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![order.clone()]);
        h.ledger.set_order_match(&order.order_hash, vec![OrderMatch { tx0_address: us(), tx1_address: buyer(), status: "completed".to_string() }]);
        h.ledger.set_asset_info(&AssetName("RAREPEPE".to_string()), unlocked_asset_info());
        fund_utxo(&h.chain);

        let results = h.controller.process().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].stage, Stage::Broadcast);

        let snapshot = h.controller.get_state();
        assert_eq!(snapshot.active_transactions.len(), 1);
        assert_eq!(h.notifier.count(xcpfolio_notify::Severity::Success), 1);
    }

    #[tokio::test]
    async fn already_delivered_order_confirms_without_broadcasting() {
        let h = harness();
        let order = sample_order("order1");
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![order.clone()]);
        h.ledger.set_order_match(&order.order_hash, vec![OrderMatch { tx0_address: us(), tx1_address: buyer(), status: "completed".to_string() }]);
        h.ledger.set_asset_info(&AssetName("RAREPEPE".to_string()), unlocked_asset_info());
        h.ledger.set_already_transferred(&AssetName("RAREPEPE".to_string()), &buyer(), &us(), true);

        let results = h.controller.process().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].stage, Stage::Confirmed);
        assert!(h.chain.broadcast_log().is_empty());
    }

    #[tokio::test]
    async fn fee_spike_aborts_at_compose() {
        let h = harness();
        let order = sample_order("order1");
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![order.clone()]);
        h.ledger.set_order_match(&order.order_hash, vec![OrderMatch { tx0_address: us(), tx1_address: buyer(), status: "completed".to_string() }]);
        h.ledger.set_asset_info(&AssetName("RAREPEPE".to_string()), unlocked_asset_info());
        h.chain.set_optimal_fee_rate(500);

        let results = h.controller.process().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].stage, Stage::Compose);
        assert!(h.chain.broadcast_log().is_empty());
    }

    #[tokio::test]
    async fn signed_fee_over_ceiling_aborts_before_broadcast() {
        let h = harness();
        let order = sample_order("order1");
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![order.clone()]);
        h.ledger.set_order_match(&order.order_hash, vec![OrderMatch { tx0_address: us(), tx1_address: buyer(), status: "completed".to_string() }]);
        h.ledger.set_asset_info(&AssetName("RAREPEPE".to_string()), unlocked_asset_info());
        fund_utxo(&h.chain);
        h.signer.set_fee_sats(50_000);

        let results = h.controller.process().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].stage, Stage::Sign);
        assert!(h.chain.broadcast_log().is_empty());
    }

    #[tokio::test]
    async fn stuck_transaction_is_replaced_via_rbf() {
        let h = harness();
        let order = sample_order("order1");
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![order.clone()]);
        h.ledger.set_order_match(&order.order_hash, vec![OrderMatch { tx0_address: us(), tx1_address: buyer(), status: "completed".to_string() }]);
        h.ledger.set_asset_info(&AssetName("RAREPEPE".to_string()), unlocked_asset_info());
        fund_utxo(&h.chain);

        let first = h.controller.process().await.unwrap();
        assert_eq!(first[0].stage, Stage::Broadcast);
        let original_txid = first[0].txid.clone().unwrap();

        // Advance far enough past the stuck threshold and past the first
        // block-tier boundary so escalation computes a strictly higher rate.
        h.chain.set_block_height(800_020);
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![]);

        let second = h.controller.process().await.unwrap();
        assert!(second.is_empty(), "no new filled orders to scan, only RBF housekeeping runs");

        let snapshot = h.controller.get_state();
        assert_eq!(snapshot.active_transactions.len(), 1);
        let active = &snapshot.active_transactions[0];
        assert_ne!(active.current_txid(), &original_txid);
        assert_eq!(active.rbf_count(), 1);
    }

    #[tokio::test]
    async fn mempool_at_capacity_skips_the_run() {
        let h = harness();
        let order = sample_order("order1");
        h.ledger.set_orders(&us(), OrderStatusFilter::Filled, vec![order]);
        h.chain.set_unconfirmed_count(25);

        let results = h.controller.process().await.unwrap();
        assert!(results.is_empty());
        assert_eq!(h.notifier.count(xcpfolio_notify::Severity::Warning), 1);
    }

    #[tokio::test]
    async fn concurrent_run_returns_empty_instead_of_blocking_forever() {
        let h = harness();
        let fut1 = h.controller.process();
        let fut2 = h.controller.process();
        let (r1, r2) = tokio::join!(fut1, fut2);
        r1.unwrap();
        r2.unwrap();
    }
}
