//! Order-history side channel (spec.md §6.4): a key-value record per order
//! plus a bounded index list, written by the controllers as a one-way side
//! effect of their state transitions. A read-only HTTP status UI is the
//! intended reader; nothing in this crate ever reads its own writes back
//! into the fulfillment or maintenance state machines (spec §9: "model this
//! as one-way data flow — controller `publishes` events, the history
//! collaborator subscribes").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use xcpfolio_state::{StateError, StateStore, StateStoreExt};
use xcpfolio_types::{AssetName, BtcAddress, OrderHash, TxId};

/// 7-day TTL per order-history record (spec §6.4).
const RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Max-100 bound on the index list (spec §6.4).
const MAX_INDEX_ENTRIES: usize = 100;

const INDEX_KEY: &str = "xcpfolio:history:index";

fn record_key(order_hash: &OrderHash) -> String {
    format!("xcpfolio:history:{}", order_hash.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub order_hash: OrderHash,
    pub asset: AssetName,
    pub buyer: Option<BtcAddress>,
    pub stage: String,
    pub txid: Option<TxId>,
    pub is_rbf: bool,
    pub recorded_at: DateTime<Utc>,
}

/// One-way publish sink the controllers hold. Never consulted for control
/// flow — failures here are logged and swallowed, matching the "core's
/// correctness does not depend on it" contract in spec §6.4.
#[async_trait]
pub trait OrderHistorySink: Send + Sync {
    async fn publish(&self, record: HistoryRecord);
}

pub struct StateStoreHistorySink<S> {
    store: Arc<S>,
}

impl<S: StateStore> StateStoreHistorySink<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn push_index(&self, order_hash: &OrderHash) -> Result<(), StateError> {
        let mut index: Vec<OrderHash> = self.store.get_fresh(INDEX_KEY).await?.unwrap_or_default();
        index.retain(|h| h != order_hash);
        index.push(order_hash.clone());
        while index.len() > MAX_INDEX_ENTRIES {
            index.remove(0);
        }
        self.store.set(INDEX_KEY, &index, Some(RECORD_TTL)).await
    }
}

#[async_trait]
impl<S: StateStore> OrderHistorySink for StateStoreHistorySink<S> {
    async fn publish(&self, record: HistoryRecord) {
        let key = record_key(&record.order_hash);
        if let Err(error) = self.store.set(&key, &record, Some(RECORD_TTL)).await {
            warn!(%error, order_hash = %record.order_hash.0, "failed to publish order-history record");
            return;
        }
        if let Err(error) = self.push_index(&record.order_hash).await {
            warn!(%error, order_hash = %record.order_hash.0, "failed to update order-history index");
        }
    }
}

/// No-op sink for tests and deployments that don't wire a status UI.
pub struct NullHistorySink;

#[async_trait]
impl OrderHistorySink for NullHistorySink {
    async fn publish(&self, _record: HistoryRecord) {}
}

/// Collapses duplicate index entries for the same order hash, keeping only
/// the most recent position. This is the core of the `fix-duplicates`
/// operational script (spec §6.6); exposed here so the CLI can call it
/// without duplicating the dedup logic.
pub async fn fix_duplicate_index_entries<S: StateStore>(store: &S) -> Result<usize, StateError> {
    let index: Vec<OrderHash> = store.get_fresh(INDEX_KEY).await?.unwrap_or_default();
    let before = index.len();
    let mut deduped: Vec<OrderHash> = Vec::with_capacity(index.len());
    for hash in index {
        deduped.retain(|h| h != &hash);
        deduped.push(hash);
    }
    let removed = before - deduped.len();
    if removed > 0 {
        store.set(INDEX_KEY, &deduped, Some(RECORD_TTL)).await?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemStore {
        values: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl StateStore for MemStore {
        async fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
            Ok(self.values.lock().get(key).cloned())
        }

        async fn set_raw(&self, key: &str, value: serde_json::Value, _ttl: Option<Duration>) -> Result<(), StateError> {
            self.values.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), StateError> {
            self.values.lock().remove(key);
            Ok(())
        }

        async fn set_if_absent_raw(
            &self,
            key: &str,
            value: serde_json::Value,
            _ttl: Duration,
        ) -> Result<bool, StateError> {
            let mut values = self.values.lock();
            if values.contains_key(key) {
                Ok(false)
            } else {
                values.insert(key.to_string(), value);
                Ok(true)
            }
        }

        async fn release_if_owner(&self, _key: &str, _identifier: &str) -> Result<bool, StateError> {
            Ok(false)
        }
    }

    fn sample(hash: &str) -> HistoryRecord {
        HistoryRecord {
            order_hash: OrderHash(hash.to_string()),
            asset: AssetName("RAREPEPE".to_string()),
            buyer: Some(BtcAddress::from("1buyer")),
            stage: "broadcast".to_string(),
            txid: Some(TxId("tx0".to_string())),
            is_rbf: false,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_writes_the_record_and_the_index() {
        let store = Arc::new(MemStore::default());
        let sink = StateStoreHistorySink::new(store.clone());

        sink.publish(sample("h1")).await;

        let record: HistoryRecord = store.get_fresh(&record_key(&OrderHash("h1".into()))).await.unwrap().unwrap();
        assert_eq!(record.order_hash.0, "h1");

        let index: Vec<OrderHash> = store.get_fresh(INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(index, vec![OrderHash("h1".into())]);
    }

    #[tokio::test]
    async fn index_is_bounded_to_max_entries() {
        let store = Arc::new(MemStore::default());
        let sink = StateStoreHistorySink::new(store.clone());

        for i in 0..MAX_INDEX_ENTRIES + 10 {
            sink.publish(sample(&format!("h{i}"))).await;
        }

        let index: Vec<OrderHash> = store.get_fresh(INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(index.len(), MAX_INDEX_ENTRIES);
        assert_eq!(index.last().unwrap().0, format!("h{}", MAX_INDEX_ENTRIES + 9));
    }

    #[tokio::test]
    async fn republishing_an_order_moves_it_to_the_back_without_duplicating() {
        let store = Arc::new(MemStore::default());
        let sink = StateStoreHistorySink::new(store.clone());

        sink.publish(sample("h1")).await;
        sink.publish(sample("h2")).await;
        sink.publish(sample("h1")).await;

        let index: Vec<OrderHash> = store.get_fresh(INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(index, vec![OrderHash("h2".into()), OrderHash("h1".into())]);
    }

    #[tokio::test]
    async fn fix_duplicates_collapses_repeated_entries() {
        let store = MemStore::default();
        store
            .set(
                INDEX_KEY,
                &vec![OrderHash("a".into()), OrderHash("b".into()), OrderHash("a".into())],
                None,
            )
            .await
            .unwrap();

        let removed = fix_duplicate_index_entries(&store).await.unwrap();
        assert_eq!(removed, 1);

        let index: Vec<OrderHash> = store.get_fresh(INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(index, vec![OrderHash("b".into()), OrderHash("a".into())]);
    }
}
