//! The state-store contract (spec.md §4.3). `StateStore` is the object-safe
//! core every backend implements; `StateStoreExt` adds the generic,
//! JSON-typed convenience methods controllers actually call.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StateError;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key as a raw JSON value. `None` if absent or expired.
    async fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StateError>;

    /// Same as [`Self::get_raw`] but bypasses any read cache a wrapper layer
    /// might apply (spec §4.3 "fresh read variants", used for duplicate
    /// prevention checks).
    async fn get_raw_fresh(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
        self.get_raw(key).await
    }

    /// Full-object overwrite, with an optional TTL.
    async fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<(), StateError>;

    async fn del(&self, key: &str) -> Result<(), StateError>;

    /// Atomic set-if-absent; `true` if this call created the key. The lock
    /// primitive (spec §3 "Distributed lock").
    async fn set_if_absent_raw(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, StateError>;

    /// Deletes `key` only if its current value equals `identifier`,
    /// atomically. `true` if the delete happened. This is what makes lock
    /// release safe: a caller whose TTL already expired and was replaced by
    /// another holder must not delete the new holder's lock (spec §8
    /// "Distributed-lock safety").
    async fn release_if_owner(&self, key: &str, identifier: &str) -> Result<bool, StateError>;
}

#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError>
    where
        Self: Sized,
    {
        match self.get_raw(key).await? {
            None => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|source| StateError::Serde { key: key.to_string(), source }),
        }
    }

    async fn get_fresh<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError>
    where
        Self: Sized,
    {
        match self.get_raw_fresh(key).await? {
            None => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|source| StateError::Serde { key: key.to_string(), source }),
        }
    }

    async fn set<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), StateError>
    where
        Self: Sized,
    {
        let v = serde_json::to_value(value).map_err(|source| StateError::Serde { key: key.to_string(), source })?;
        self.set_raw(key, v, ttl).await
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}
