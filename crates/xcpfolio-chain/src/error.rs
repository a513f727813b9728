use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} responded with an error: {message}")]
    Api { endpoint: String, message: String },

    #[error("could not decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// Every broadcast endpoint was tried and none accepted the transaction,
    /// and none of them recognized it as already-in-mempool either.
    #[error("broadcast rejected by all endpoints: {0}")]
    AllEndpointsRejected(String),
}
