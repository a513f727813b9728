//! Signs the raw transactions the ledger composes (spec.md §4.1 stage 5).

pub mod client;
pub mod error;
pub mod types;

pub use client::{Signer, WifSigner, RBF_SEQUENCE};
pub use error::SignerError;
pub use types::{PrevOut, SignedTransaction};
