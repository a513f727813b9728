use serde::Deserialize;

use xcpfolio_types::TxId;

#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub confirmed: bool,
    /// The spent output's scriptPubkey, hex-encoded. Esplora's
    /// `/address/{addr}/utxo` does not return this directly; the concrete
    /// client backfills it with a second `/tx/{txid}` lookup per UTXO. Kept
    /// here rather than re-fetched by every caller since the signer needs it
    /// for the P2WPKH sighash (spec §4.1 stage 5).
    #[serde(default)]
    pub script_pubkey_hex: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FeeRates {
    #[serde(rename = "fastestFee")]
    pub fastest_fee: u64,
    #[serde(rename = "halfHourFee")]
    pub half_hour_fee: u64,
    #[serde(rename = "hourFee")]
    pub hour_fee: u64,
    #[serde(rename = "economyFee")]
    pub economy_fee: u64,
    #[serde(rename = "minimumFee")]
    pub minimum_fee: u64,
}

/// Subset of Esplora's `/tx/{txid}` response used only to backfill
/// scriptPubkeys for [`Utxo`]s.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EsploraTx {
    pub vout: Vec<EsploraVout>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EsploraVout {
    pub scriptpubkey: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainTransaction {
    pub txid: String,
    #[serde(default)]
    pub status: ChainTransactionStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainTransactionStatus {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// The outcome of a broadcast attempt, after the "already in mempool" string
/// heuristic has been centralized here instead of leaking into the
/// controller (spec.md §9 design note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted(TxId),
    AlreadyInMempool(TxId),
}

impl BroadcastOutcome {
    pub fn txid(&self) -> &TxId {
        match self {
            BroadcastOutcome::Accepted(txid) => txid,
            BroadcastOutcome::AlreadyInMempool(txid) => txid,
        }
    }
}

/// Looks for a 64-character hex run in `body`, the shape of a txid, which
/// "already in mempool"-style error bodies carry (spec.md §4.5, §6.3).
pub fn extract_txid_from_error_body(body: &str) -> Option<TxId> {
    let bytes = body.as_bytes();
    let mut run_start = None;
    for (i, &b) in bytes.iter().enumerate() {
        let is_hex = b.is_ascii_hexdigit();
        match (is_hex, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if i - start == 64 {
                    return Some(TxId(body[start..i].to_ascii_lowercase()));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        if bytes.len() - start == 64 {
            return Some(TxId(body[start..].to_ascii_lowercase()));
        }
    }
    None
}

pub fn looks_like_already_in_mempool(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("already") && lower.contains("mempool")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_txid_from_known_error_shape() {
        let body = "Transaction already in mempool: a1b2c3d4e5f60718293a4b5c6d7e8f9021436587092a1b3c4d5e6f708192a3b4";
        let txid = extract_txid_from_error_body(body).unwrap();
        assert_eq!(txid.0.len(), 64);
    }

    #[test]
    fn returns_none_when_no_64_char_hex_run_present() {
        assert_eq!(extract_txid_from_error_body("insufficient funds"), None);
    }

    #[test]
    fn already_in_mempool_heuristic_requires_both_words() {
        assert!(looks_like_already_in_mempool("txn-already-in-the-mempool"));
        assert!(!looks_like_already_in_mempool("already seen this transaction"));
    }
}
