use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store unreachable: {0}")]
    Connection(String),
    #[error("state store command failed: {0}")]
    Command(String),
    #[error("failed to (de)serialize value for key {key}: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<redis::RedisError> for StateError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            StateError::Connection(e.to_string())
        } else {
            StateError::Command(e.to_string())
        }
    }
}
