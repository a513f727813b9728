//! Redis-backed [`StateStore`] (spec.md §4.3, §6.1 `STATE_STORE_URL`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::instrument;

use crate::error::StateError;
use crate::store::StateStore;

/// Deletes `key` iff its current value equals `ARGV[1]`. Runs as a single
/// command server-side so the check and the delete can't race against a
/// concurrent lock acquisition.
const RELEASE_IF_OWNER_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisStateStore {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisStateStore {
    pub async fn connect(url: &str) -> Result<Self, StateError> {
        let client = Client::open(url).map_err(StateError::from)?;
        let conn = ConnectionManager::new(client).await.map_err(StateError::from)?;
        Ok(Self { conn, release_script: Script::new(RELEASE_IF_OWNER_SCRIPT) })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
        let raw: Option<String> = self.conn.clone().get(key).await.map_err(StateError::from)?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|source| StateError::Serde { key: key.to_string(), source }),
        }
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<(), StateError> {
        let raw = value.to_string();
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, raw, secs).await.map_err(StateError::from)?;
            }
            None => {
                conn.set::<_, _, ()>(key, raw).await.map_err(StateError::from)?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn del(&self, key: &str) -> Result<(), StateError> {
        self.conn.clone().del::<_, ()>(key).await.map_err(StateError::from)?;
        Ok(())
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent_raw(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let raw = value.to_string();
        let secs = ttl.as_secs().max(1);
        let created: bool = redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .arg("NX")
            .arg("EX")
            .arg(secs)
            .query_async::<_, Option<String>>(&mut self.conn.clone())
            .await
            .map_err(StateError::from)?
            .is_some();
        Ok(created)
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_if_owner(&self, key: &str, identifier: &str) -> Result<bool, StateError> {
        // Stored values are always `serde_json::Value::to_string()`, which
        // JSON-quotes strings; encode the same way here so the Lua
        // script's `==` actually matches what's in Redis.
        let encoded = serde_json::Value::String(identifier.to_string()).to_string();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(encoded)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(StateError::from)?;
        Ok(deleted == 1)
    }
}
