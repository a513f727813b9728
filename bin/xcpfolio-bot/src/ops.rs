//! One-shot operational subcommands (spec.md §6.6): restartable maintenance
//! tasks an operator runs by hand, outside the scheduler loop.

use std::sync::Arc;

use tracing::info;

use xcpfolio_history::fix_duplicate_index_entries;
use xcpfolio_state::{StateStore, StateStoreExt};
use xcpfolio_types::{ActiveOrderEntry, FulfillmentEnvelope, MaintenanceEnvelope};

const FULFILLMENT_STATE_KEY: &str = "fulfillment-state";
const MAINTENANCE_STATE_KEY: &str = "xcpfolio:maintenance:state";
/// Matches `xcpfolio_fulfillment`'s private `ENVELOPE_TTL` constant (spec
/// §6.5: 30-day TTL on the fulfillment envelope); duplicated here rather
/// than exported since it's an implementation constant, not part of that
/// crate's public contract.
const FULFILLMENT_ENVELOPE_TTL: std::time::Duration = std::time::Duration::from_secs(30 * 24 * 60 * 60);

pub async fn reset_last_block<S: StateStore>(store: Arc<S>) -> eyre::Result<()> {
    let mut envelope: FulfillmentEnvelope = store.get_fresh(FULFILLMENT_STATE_KEY).await?.unwrap_or_default();
    envelope.last_block = 0;
    envelope.last_order_hash = None;
    store.set(FULFILLMENT_STATE_KEY, &envelope, Some(FULFILLMENT_ENVELOPE_TTL)).await?;
    info!("reset lastBlock and lastOrderHash in the fulfillment envelope");
    Ok(())
}

pub async fn clear_processed<S: StateStore>(store: Arc<S>) -> eyre::Result<()> {
    let mut envelope: FulfillmentEnvelope = store.get_fresh(FULFILLMENT_STATE_KEY).await?.unwrap_or_default();
    let count = envelope.processed_orders.len();
    envelope.processed_orders.clear();
    store.set(FULFILLMENT_STATE_KEY, &envelope, Some(FULFILLMENT_ENVELOPE_TTL)).await?;
    info!(count, "cleared the fulfillment envelope's processedOrders set");
    Ok(())
}

/// Replays durable active-order state into the order-history side channel
/// (spec §6.4) for UI recovery after the history store has been rebuilt or
/// lost. The fulfillment envelope's `processedOrders` carries only order
/// hashes, not asset/buyer data, so only the maintenance envelope's richer
/// `ActiveOrderEntry` records (which do carry asset/txid/price) are
/// replayed; the fulfillment count is logged for operator visibility.
pub async fn backfill_history<S: StateStore>(store: Arc<S>) -> eyre::Result<()> {
    let fulfillment: FulfillmentEnvelope = store.get_fresh(FULFILLMENT_STATE_KEY).await?.unwrap_or_default();
    info!(
        count = fulfillment.processed_orders.len(),
        "fulfillment processedOrders carry no asset/buyer data and cannot be backfilled into history"
    );

    let maintenance: MaintenanceEnvelope = store.get_fresh(MAINTENANCE_STATE_KEY).await?.unwrap_or_default();
    let sink = xcpfolio_history::StateStoreHistorySink::new(store.clone());
    let mut replayed = 0usize;
    for (asset, entry) in maintenance.active_orders.iter() {
        publish_backfill(&sink, asset, entry).await;
        replayed += 1;
    }
    info!(replayed, "backfilled maintenance active-order entries into the order-history side channel");
    Ok(())
}

async fn publish_backfill<S: StateStore>(
    sink: &xcpfolio_history::StateStoreHistorySink<S>,
    asset: &xcpfolio_types::AssetName,
    entry: &ActiveOrderEntry,
) {
    use xcpfolio_history::{HistoryRecord, OrderHistorySink};
    use xcpfolio_types::OrderHash;

    sink.publish(HistoryRecord {
        order_hash: OrderHash(format!("maintenance:{}:backfill", asset.0)),
        asset: asset.clone(),
        buyer: None,
        stage: "backfill".to_string(),
        txid: entry.txid.clone(),
        is_rbf: false,
        recorded_at: entry.broadcast_time,
    })
    .await;
}

pub async fn fix_duplicates<S: StateStore>(store: Arc<S>) -> eyre::Result<()> {
    let removed = fix_duplicate_index_entries(&*store).await?;
    info!(removed, "collapsed duplicate order-history index entries");
    Ok(())
}
