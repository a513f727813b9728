use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid WIF private key: {0}")]
    InvalidKey(String),

    #[error("invalid unsigned transaction hex: {0}")]
    InvalidTransaction(String),

    #[error("input {0} has no matching prevout supplied")]
    MissingPrevout(usize),

    #[error("sighash computation failed for input {index}: {message}")]
    Sighash { index: usize, message: String },
}
