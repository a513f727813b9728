//! Active-transaction tracking (spec.md §3, "Asset transfer state").

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::primitive::{AssetName, BtcAddress, OrderHash, TxId};

/// The pipeline stage a [`crate::result::ProcessOrderResult`] or
/// [`crate::failure::FailureRecord`] is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Compose,
    Sign,
    Broadcast,
    Confirmed,
    Backoff,
    DryRun,
}

bitflags! {
    /// Mutable flags on an [`AssetTransfer`], set by the mempool
    /// reconciliation and stuck-transaction passes (spec §4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransferFlags: u8 {
        /// The active tx has been stuck long enough, or dropped from the
        /// mempool, that the next run should attempt an RBF bump.
        const NEEDS_RBF = 0b01;
        /// The current txid is no longer observed in the mempool and none of
        /// its RBF history is confirmed either.
        const DROPPED_FROM_MEMPOOL = 0b10;
    }
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// An in-process record of a broadcast transfer transaction for one order.
/// Created on successful broadcast; destroyed on confirmation or terminal
/// failure.
///
/// Invariant: `txids.last() == Some(&current_txid)` and
/// `rbf_count == txids.len() - 1`. This is maintained by construction via
/// [`AssetTransfer::new`] and [`AssetTransfer::push_rbf_txid`] — there is no
/// other way to mutate `txids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTransfer {
    pub order_hash: OrderHash,
    pub asset: AssetName,
    pub buyer: BtcAddress,
    txids: Vec<TxId>,
    pub broadcast_at: DateTime<Utc>,
    pub broadcast_block: u64,
    /// Effective fee rate of the current (most recent) txid, sat/vB.
    pub fee_rate: u64,
    pub flags: TransferFlags,
}

impl AssetTransfer {
    pub fn new(
        order_hash: OrderHash,
        asset: AssetName,
        buyer: BtcAddress,
        txid: TxId,
        broadcast_at: DateTime<Utc>,
        broadcast_block: u64,
        fee_rate: u64,
    ) -> Self {
        Self {
            order_hash,
            asset,
            buyer,
            txids: vec![txid],
            broadcast_at,
            broadcast_block,
            fee_rate,
            flags: TransferFlags::empty(),
        }
    }

    pub fn original_txid(&self) -> &TxId {
        &self.txids[0]
    }

    pub fn current_txid(&self) -> &TxId {
        self.txids.last().expect("txids is never empty")
    }

    pub fn rbf_count(&self) -> usize {
        self.txids.len() - 1
    }

    pub fn all_txids(&self) -> &[TxId] {
        &self.txids
    }

    /// Appends a replacement txid after a successful RBF broadcast, bumps
    /// the fee rate, resets both flags, and advances the broadcast block.
    /// Maintains the struct's core invariant.
    pub fn push_rbf_txid(&mut self, new_txid: TxId, new_fee_rate: u64, broadcast_block: u64) {
        self.txids.push(new_txid);
        self.fee_rate = new_fee_rate;
        self.broadcast_block = broadcast_block;
        self.flags = TransferFlags::empty();
    }

    pub fn needs_rbf(&self) -> bool {
        self.flags.contains(TransferFlags::NEEDS_RBF)
    }

    pub fn dropped_from_mempool(&self) -> bool {
        self.flags.contains(TransferFlags::DROPPED_FROM_MEMPOOL)
    }

    pub fn mark_needs_rbf(&mut self) {
        self.flags.insert(TransferFlags::NEEDS_RBF);
    }

    pub fn mark_dropped_from_mempool(&mut self) {
        self.flags.insert(TransferFlags::DROPPED_FROM_MEMPOOL | TransferFlags::NEEDS_RBF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AssetTransfer {
        AssetTransfer::new(
            OrderHash("h".into()),
            AssetName("A".into()),
            BtcAddress::from("1buyer"),
            TxId("tx0".into()),
            Utc::now(),
            100,
            10,
        )
    }

    #[test]
    fn invariant_holds_after_construction() {
        let t = sample();
        assert_eq!(t.current_txid(), &TxId("tx0".into()));
        assert_eq!(t.original_txid(), &TxId("tx0".into()));
        assert_eq!(t.rbf_count(), 0);
    }

    #[test]
    fn invariant_holds_after_rbf_push() {
        let mut t = sample();
        t.mark_needs_rbf();
        t.push_rbf_txid(TxId("tx1".into()), 20, 104);
        assert_eq!(t.current_txid(), &TxId("tx1".into()));
        assert_eq!(t.original_txid(), &TxId("tx0".into()));
        assert_eq!(t.rbf_count(), 1);
        assert_eq!(t.all_txids().len(), t.rbf_count() + 1);
        assert!(!t.needs_rbf());

        t.push_rbf_txid(TxId("tx2".into()), 30, 108);
        assert_eq!(t.rbf_count(), 2);
        assert_eq!(t.current_txid(), &TxId("tx2".into()));
    }

    #[test]
    fn dropped_from_mempool_implies_needs_rbf() {
        let mut t = sample();
        t.mark_dropped_from_mempool();
        assert!(t.dropped_from_mempool());
        assert!(t.needs_rbf());
    }
}
