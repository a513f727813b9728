use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The ledger answered with an envelope carrying `error`. The message is
    /// preserved verbatim: the retry and fee-ceiling heuristics pattern-match
    /// on substrings of it (spec.md §4.4, §7).
    #[error("ledger error from {endpoint}: {message}")]
    Api { endpoint: String, message: String },

    #[error("could not decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    pub fn message(&self) -> String {
        match self {
            LedgerError::Http { source, .. } => source.to_string(),
            LedgerError::Api { message, .. } => message.clone(),
            LedgerError::Decode { source, .. } => source.to_string(),
        }
    }
}
