//! A [`ChainClient`] fake backed by plain in-memory maps, configurable
//! enough to drive every scenario in spec.md §8 (mempool-at-capacity, stuck
//! transaction, RBF, already-in-mempool broadcast responses).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use xcpfolio_chain::{BroadcastOutcome, ChainClient, ChainError, ChainTransaction, ChainTransactionStatus, FeeRates, Utxo};
use xcpfolio_types::{BtcAddress, TxId};

pub enum BroadcastBehavior {
    Accept,
    AlreadyInMempool,
    Reject(String),
}

pub struct FakeChainClient {
    block_height: Mutex<u64>,
    utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    fee_rates: Mutex<FeeRates>,
    minimum_fee_rate: Mutex<f64>,
    unconfirmed_count: Mutex<u32>,
    in_mempool: Mutex<HashSet<String>>,
    confirmed: Mutex<HashMap<String, u64>>,
    broadcast_behavior: Mutex<BroadcastBehavior>,
    broadcast_log: Mutex<Vec<String>>,
}

impl Default for FakeChainClient {
    fn default() -> Self {
        Self {
            block_height: Mutex::new(800_000),
            utxos: Mutex::new(HashMap::new()),
            fee_rates: Mutex::new(FeeRates {
                fastest_fee: 20,
                half_hour_fee: 15,
                hour_fee: 10,
                economy_fee: 3,
                minimum_fee: 1,
            }),
            minimum_fee_rate: Mutex::new(1.0),
            unconfirmed_count: Mutex::new(0),
            in_mempool: Mutex::new(HashSet::new()),
            confirmed: Mutex::new(HashMap::new()),
            broadcast_behavior: Mutex::new(BroadcastBehavior::Accept),
            broadcast_log: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block_height(&self, height: u64) {
        *self.block_height.lock() = height;
    }

    pub fn set_utxos(&self, address: &BtcAddress, utxos: Vec<Utxo>) {
        self.utxos.lock().insert(address.0.clone(), utxos);
    }

    pub fn set_optimal_fee_rate(&self, rate: u64) {
        self.fee_rates.lock().fastest_fee = rate;
    }

    pub fn set_minimum_fee_rate(&self, rate: f64) {
        *self.minimum_fee_rate.lock() = rate;
    }

    pub fn set_unconfirmed_count(&self, count: u32) {
        *self.unconfirmed_count.lock() = count;
    }

    pub fn push_to_mempool(&self, txid: &TxId) {
        self.in_mempool.lock().insert(txid.0.clone());
    }

    pub fn drop_from_mempool(&self, txid: &TxId) {
        self.in_mempool.lock().remove(&txid.0);
    }

    pub fn confirm(&self, txid: &TxId, block_height: u64) {
        self.in_mempool.lock().remove(&txid.0);
        self.confirmed.lock().insert(txid.0.clone(), block_height);
    }

    pub fn set_broadcast_behavior(&self, behavior: BroadcastBehavior) {
        *self.broadcast_behavior.lock() = behavior;
    }

    pub fn broadcast_log(&self) -> Vec<String> {
        self.broadcast_log.lock().clone()
    }
}

#[async_trait]
impl ChainClient for FakeChainClient {
    async fn get_current_block_height(&self) -> Result<u64, ChainError> {
        Ok(*self.block_height.lock())
    }

    async fn fetch_utxos(&self, address: &BtcAddress) -> Result<Vec<Utxo>, ChainError> {
        Ok(self.utxos.lock().get(&address.0).cloned().unwrap_or_default())
    }

    async fn get_fee_rates(&self) -> Result<FeeRates, ChainError> {
        Ok(*self.fee_rates.lock())
    }

    async fn get_optimal_fee_rate(&self) -> Result<u64, ChainError> {
        Ok(self.fee_rates.lock().fastest_fee)
    }

    async fn get_actual_minimum_fee_rate(&self) -> Result<f64, ChainError> {
        Ok(*self.minimum_fee_rate.lock())
    }

    async fn get_unconfirmed_tx_count(&self, _address: &BtcAddress) -> Result<u32, ChainError> {
        Ok(*self.unconfirmed_count.lock())
    }

    async fn is_in_mempool(&self, txid: &TxId) -> Result<bool, ChainError> {
        Ok(self.in_mempool.lock().contains(&txid.0))
    }

    async fn get_transaction(&self, txid: &TxId) -> Result<Option<ChainTransaction>, ChainError> {
        if let Some(&height) = self.confirmed.lock().get(&txid.0) {
            return Ok(Some(ChainTransaction {
                txid: txid.0.clone(),
                status: ChainTransactionStatus { confirmed: true, block_height: Some(height) },
            }));
        }
        if self.in_mempool.lock().contains(&txid.0) {
            return Ok(Some(ChainTransaction {
                txid: txid.0.clone(),
                status: ChainTransactionStatus { confirmed: false, block_height: None },
            }));
        }
        Ok(None)
    }

    async fn broadcast_transaction(&self, signed_hex: &str) -> Result<BroadcastOutcome, ChainError> {
        self.broadcast_log.lock().push(signed_hex.to_string());
        match &*self.broadcast_behavior.lock() {
            BroadcastBehavior::Accept => {
                let txid = signed_hex
                    .strip_prefix("signedhex:")
                    .map(|t| TxId(t.to_string()))
                    .unwrap_or_else(|| TxId(format!("broadcast{}", self.broadcast_log.lock().len())));
                self.in_mempool.lock().insert(txid.0.clone());
                Ok(BroadcastOutcome::Accepted(txid))
            }
            BroadcastBehavior::AlreadyInMempool => {
                let txid = TxId("already-in-mempool-txid".to_string());
                Ok(BroadcastOutcome::AlreadyInMempool(txid))
            }
            BroadcastBehavior::Reject(message) => Err(ChainError::AllEndpointsRejected(message.clone())),
        }
    }
}
