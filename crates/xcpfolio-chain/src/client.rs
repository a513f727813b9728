//! The Bitcoin fee/mempool/broadcast client the core consumes (spec.md
//! §4.5, §6.3). Mirrors the mempool.space / Blockstream Esplora API shape;
//! `broadcast_transaction` falls back across configured endpoints.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{instrument, warn};

use xcpfolio_types::{BtcAddress, TxId};

use crate::error::ChainError;
use crate::types::{
    extract_txid_from_error_body, looks_like_already_in_mempool, BroadcastOutcome, ChainTransaction, EsploraTx,
    FeeRates, Utxo,
};

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_current_block_height(&self) -> Result<u64, ChainError>;

    async fn fetch_utxos(&self, address: &BtcAddress) -> Result<Vec<Utxo>, ChainError>;

    async fn get_fee_rates(&self) -> Result<FeeRates, ChainError>;

    /// Next-block estimate, used by the latency-sensitive fulfillment path.
    async fn get_optimal_fee_rate(&self) -> Result<u64, ChainError>;

    /// The lowest fee rate likely to still relay, used by maintenance (which
    /// is not latency-sensitive and may legitimately be sub-1 sat/vB).
    async fn get_actual_minimum_fee_rate(&self) -> Result<f64, ChainError>;

    async fn get_unconfirmed_tx_count(&self, address: &BtcAddress) -> Result<u32, ChainError>;

    async fn is_in_mempool(&self, txid: &TxId) -> Result<bool, ChainError>;

    async fn get_transaction(&self, txid: &TxId) -> Result<Option<ChainTransaction>, ChainError>;

    async fn broadcast_transaction(&self, signed_hex: &str) -> Result<BroadcastOutcome, ChainError>;
}

pub struct HttpChainClient {
    http: Client,
    address_api: String,
    broadcast_endpoints: Vec<String>,
}

impl HttpChainClient {
    /// `primary_api` drives every read (`mempool_api` in configuration);
    /// `broadcast_endpoints` is tried in order on `broadcast_transaction`,
    /// typically `[mempool_api, blockstream_api]`.
    pub fn new(http: Client, primary_api: impl Into<String>, broadcast_endpoints: Vec<String>) -> Self {
        Self { http, address_api: primary_api.into(), broadcast_endpoints }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.address_api.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    #[instrument(skip(self), level = "debug")]
    async fn get_current_block_height(&self) -> Result<u64, ChainError> {
        let endpoint = self.url("/blocks/tip/height");
        let text = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| ChainError::Http { endpoint: endpoint.clone(), source })?
            .text()
            .await
            .map_err(|source| ChainError::Http { endpoint: endpoint.clone(), source })?;
        text.trim()
            .parse()
            .map_err(|_| ChainError::Api { endpoint, message: format!("non-numeric height {text:?}") })
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_utxos(&self, address: &BtcAddress) -> Result<Vec<Utxo>, ChainError> {
        let endpoint = self.url(&format!("/address/{}/utxo", address.0));
        let mut utxos: Vec<Utxo> = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| ChainError::Http { endpoint: endpoint.clone(), source })?
            .json()
            .await
            .map_err(|source| ChainError::Http { endpoint, source })?;

        // Esplora's utxo listing omits scriptPubkey; the signer needs it, so
        // backfill it with one lookup per distinct funding transaction.
        let mut script_pubkeys: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
        for utxo in &utxos {
            if script_pubkeys.contains_key(&utxo.txid) {
                continue;
            }
            let tx_endpoint = self.url(&format!("/tx/{}", utxo.txid));
            let tx: EsploraTx = self
                .http
                .get(&tx_endpoint)
                .send()
                .await
                .map_err(|source| ChainError::Http { endpoint: tx_endpoint.clone(), source })?
                .json()
                .await
                .map_err(|source| ChainError::Http { endpoint: tx_endpoint, source })?;
            script_pubkeys.insert(utxo.txid.clone(), tx.vout.into_iter().map(|o| o.scriptpubkey).collect());
        }
        for utxo in &mut utxos {
            if let Some(scripts) = script_pubkeys.get(&utxo.txid) {
                if let Some(script) = scripts.get(utxo.vout as usize) {
                    utxo.script_pubkey_hex = script.clone();
                }
            }
        }
        Ok(utxos)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_fee_rates(&self) -> Result<FeeRates, ChainError> {
        let endpoint = self.url("/v1/fees/recommended");
        self.http
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| ChainError::Http { endpoint: endpoint.clone(), source })?
            .json()
            .await
            .map_err(|source| ChainError::Http { endpoint, source })
    }

    async fn get_optimal_fee_rate(&self) -> Result<u64, ChainError> {
        Ok(self.get_fee_rates().await?.fastest_fee)
    }

    async fn get_actual_minimum_fee_rate(&self) -> Result<f64, ChainError> {
        let rates = self.get_fee_rates().await?;
        Ok((rates.minimum_fee as f64).min(rates.economy_fee as f64))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_unconfirmed_tx_count(&self, address: &BtcAddress) -> Result<u32, ChainError> {
        #[derive(serde::Deserialize)]
        struct MempoolStats {
            tx_count: u32,
        }
        #[derive(serde::Deserialize)]
        struct AddressStats {
            mempool_stats: MempoolStats,
        }
        let endpoint = self.url(&format!("/address/{}", address.0));
        let stats: AddressStats = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| ChainError::Http { endpoint: endpoint.clone(), source })?
            .json()
            .await
            .map_err(|source| ChainError::Http { endpoint, source })?;
        Ok(stats.mempool_stats.tx_count)
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_in_mempool(&self, txid: &TxId) -> Result<bool, ChainError> {
        Ok(self.get_transaction(txid).await?.map(|tx| !tx.status.confirmed).unwrap_or(false))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_transaction(&self, txid: &TxId) -> Result<Option<ChainTransaction>, ChainError> {
        let endpoint = self.url(&format!("/tx/{}", txid.0));
        let response = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|source| ChainError::Http { endpoint: endpoint.clone(), source })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|source| ChainError::Http { endpoint, source })
    }

    #[instrument(skip(self, signed_hex), level = "debug")]
    async fn broadcast_transaction(&self, signed_hex: &str) -> Result<BroadcastOutcome, ChainError> {
        let mut last_message = String::new();
        for base in &self.broadcast_endpoints {
            let endpoint = format!("{}/tx", base.trim_end_matches('/'));
            let response = match self.http.post(&endpoint).body(signed_hex.to_string()).send().await {
                Ok(r) => r,
                Err(source) => {
                    warn!(endpoint, error = %source, "broadcast endpoint unreachable, trying next");
                    last_message = source.to_string();
                    continue;
                }
            };
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                return Ok(BroadcastOutcome::Accepted(TxId(body.trim().to_string())));
            }
            if looks_like_already_in_mempool(&body) {
                if let Some(txid) = extract_txid_from_error_body(&body) {
                    return Ok(BroadcastOutcome::AlreadyInMempool(txid));
                }
            }
            warn!(endpoint, status = %status, body, "broadcast endpoint rejected transaction, trying next");
            last_message = body;
        }
        Err(ChainError::AllEndpointsRejected(last_message))
    }
}
