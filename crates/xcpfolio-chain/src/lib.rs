//! HTTP client for the Bitcoin fee/mempool/broadcast API (spec.md §4.5,
//! §6.3): a mempool.space / Blockstream Esplora-shaped surface.

pub mod client;
pub mod error;
pub mod types;

pub use client::{ChainClient, HttpChainClient};
pub use error::ChainError;
pub use types::{BroadcastOutcome, ChainTransaction, FeeRates, Utxo};
