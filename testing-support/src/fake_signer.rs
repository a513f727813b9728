//! A [`Signer`] fake that hands back a deterministic, incrementing txid and
//! a configurable fee, so tests can drive the fee-ceiling boundary (spec §8
//! "Fee ceiling on signed tx") without real key material.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use xcpfolio_signer::{PrevOut, SignedTransaction, Signer, SignerError};
use xcpfolio_types::TxId;

pub struct FakeSigner {
    next_txid: AtomicU64,
    /// `fee_sats` to report for every signature, overridable per-call via
    /// [`Self::set_next_fee`].
    fee_sats: Mutex<u64>,
    vsize: Mutex<u64>,
    fail_next: Mutex<Option<String>>,
}

impl Default for FakeSigner {
    fn default() -> Self {
        Self { next_txid: AtomicU64::new(0), fee_sats: Mutex::new(2_000), vsize: Mutex::new(140), fail_next: Mutex::new(None) }
    }
}

impl FakeSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fee_sats(&self, fee_sats: u64) {
        *self.fee_sats.lock() = fee_sats;
    }

    pub fn set_vsize(&self, vsize: u64) {
        *self.vsize.lock() = vsize;
    }

    pub fn fail_next_with(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign_transaction(
        &self,
        _unsigned_hex: &str,
        _prevouts: &[PrevOut],
    ) -> Result<SignedTransaction, SignerError> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(SignerError::InvalidTransaction(message));
        }
        let n = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let txid = TxId(format!("tx{n}"));
        Ok(SignedTransaction {
            // Embeds the txid so `FakeChainClient::broadcast_transaction` can
            // hand back the same id a real broadcast endpoint would recover
            // from decoding the raw transaction.
            hex: format!("signedhex:{}", txid.0),
            txid,
            vsize: *self.vsize.lock(),
            fee_sats: *self.fee_sats.lock(),
        })
    }
}
