//! Raw-transaction signing (spec.md §4.1 stage 5, §4.5). Every input is
//! signaled RBF-replaceable (`sequence = 0xfffffffd`) regardless of whether
//! this particular broadcast will ever be replaced — the ledger's compose
//! step has no opinion on sequence numbers, so the signer is the single
//! place that enforces it.

use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PrivateKey, ScriptBuf, Sequence, Transaction, Witness};

use xcpfolio_types::TxId;

use crate::error::SignerError;
use crate::types::{PrevOut, SignedTransaction};

/// The RBF-signaling sequence value every input is set to before signing
/// (spec.md §4.1: "the signer must use sequence = 0xfffffffd on every
/// input").
pub const RBF_SEQUENCE: u32 = 0xffff_fffd;

#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign_transaction(
        &self,
        unsigned_hex: &str,
        prevouts: &[PrevOut],
    ) -> Result<SignedTransaction, SignerError>;
}

pub struct WifSigner {
    key: PrivateKey,
}

impl WifSigner {
    pub fn from_wif(wif: &str) -> Result<Self, SignerError> {
        let key = PrivateKey::from_wif(wif).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }
}

#[async_trait]
impl Signer for WifSigner {
    async fn sign_transaction(
        &self,
        unsigned_hex: &str,
        prevouts: &[PrevOut],
    ) -> Result<SignedTransaction, SignerError> {
        let raw = hex_decode(unsigned_hex).map_err(SignerError::InvalidTransaction)?;
        let mut tx: Transaction = deserialize(&raw).map_err(|e| SignerError::InvalidTransaction(e.to_string()))?;

        if tx.input.len() != prevouts.len() {
            return Err(SignerError::MissingPrevout(prevouts.len()));
        }
        for input in tx.input.iter_mut() {
            input.sequence = Sequence(RBF_SEQUENCE);
        }

        let secp = Secp256k1::new();
        let public_key = self.key.public_key(&secp);
        let unsigned = tx.clone();
        let mut cache = SighashCache::new(&unsigned);

        for (index, prevout) in prevouts.iter().enumerate() {
            let script_pubkey_bytes = hex_decode(&prevout.script_pubkey_hex).map_err(SignerError::InvalidTransaction)?;
            let script_pubkey = ScriptBuf::from_bytes(script_pubkey_bytes);

            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &script_pubkey,
                    bitcoin::Amount::from_sat(prevout.value_sats),
                    EcdsaSighashType::All,
                )
                .map_err(|e| SignerError::Sighash { index, message: e.to_string() })?;

            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_ecdsa(&message, &self.key.inner);
            let ecdsa_sig = EcdsaSignature { signature, sighash_type: EcdsaSighashType::All };

            let mut witness = Witness::new();
            witness.push(ecdsa_sig.serialize());
            witness.push(public_key.to_bytes());
            tx.input[index].witness = witness;
        }

        let fee_sats = prevouts.iter().map(|p| p.value_sats).sum::<u64>()
            - tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>();

        let signed_hex = hex_encode(&serialize(&tx));
        let txid = TxId(tx.compute_txid().to_string());

        Ok(SignedTransaction { hex: signed_hex, txid, vsize: tx.vsize() as u64, fee_sats })
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0xde, 0xad, 0xbe, 0xef];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "deadbeef");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn rejects_odd_length_hex() {
        assert!(hex_decode("abc").is_err());
    }
}
