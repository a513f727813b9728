use xcpfolio_types::TxId;

/// The previous output an input spends, in input order. Resolved by the
/// caller (via the chain client) before signing — the signer itself never
/// talks to the network.
#[derive(Debug, Clone)]
pub struct PrevOut {
    pub value_sats: u64,
    pub script_pubkey_hex: String,
}

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hex: String,
    pub txid: TxId,
    pub vsize: u64,
    pub fee_sats: u64,
}
