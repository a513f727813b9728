//! An in-memory [`StateStore`] fake (SPEC_FULL.md §5), following the same
//! `Mutex<HashMap<..>>` shape the real crates' own unit tests already use
//! for `MemStore`, just promoted to a shared, reusable fake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use xcpfolio_state::{StateError, StateStore};

#[derive(Default)]
pub struct FakeStateStore {
    /// Stored as the serialized JSON text, matching `RedisStateStore`
    /// (which stores `value.to_string()`) rather than the parsed
    /// `serde_json::Value` — a `Value::String` round-trips through a
    /// literal `"..."`, and lock-release comparisons need to see that.
    values: Mutex<HashMap<String, String>>,
    /// When set, the next `set_if_absent_raw` call targeting this key fails
    /// to acquire regardless of whether the key is actually present —
    /// simulates a concurrent holder racing in at the server.
    deny_lock: Mutex<Option<String>>,
}

impl FakeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_next_lock(&self, key: impl Into<String>) {
        *self.deny_lock.lock() = Some(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }
}

#[async_trait]
impl StateStore for FakeStateStore {
    async fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
        match self.values.lock().get(key) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|source| StateError::Serde { key: key.to_string(), source }),
        }
    }

    async fn set_raw(&self, key: &str, value: serde_json::Value, _ttl: Option<Duration>) -> Result<(), StateError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StateError> {
        self.values.lock().remove(key);
        Ok(())
    }

    async fn set_if_absent_raw(
        &self,
        key: &str,
        value: serde_json::Value,
        _ttl: Duration,
    ) -> Result<bool, StateError> {
        let mut deny = self.deny_lock.lock();
        if deny.as_deref() == Some(key) {
            *deny = None;
            return Ok(false);
        }
        drop(deny);

        let mut values = self.values.lock();
        if values.contains_key(key) {
            Ok(false)
        } else {
            values.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn release_if_owner(&self, key: &str, identifier: &str) -> Result<bool, StateError> {
        let encoded = serde_json::Value::String(identifier.to_string()).to_string();
        let mut values = self.values.lock();
        if values.get(key) == Some(&encoded) {
            values.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
