//! In-process read cache over a [`StateStore`] (spec.md §4.3: envelope reads
//! are cached for a few seconds to avoid hammering the state store on every
//! controller tick; duplicate-prevention checks must bypass it).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StateError;
use crate::store::StateStore;

const DEFAULT_TTL: Duration = Duration::from_secs(5);

struct Entry {
    value: Option<serde_json::Value>,
    cached_at: Instant,
}

pub struct CachingStateStore<S> {
    inner: S,
    ttl: Duration,
    cache: Mutex<HashMap<String, Entry>>,
}

impl<S: StateStore> CachingStateStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: S, ttl: Duration) -> Self {
        Self { inner, ttl, cache: Mutex::new(HashMap::new()) }
    }

    fn cached(&self, key: &str) -> Option<Option<serde_json::Value>> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn store(&self, key: &str, value: Option<serde_json::Value>) {
        self.cache.lock().insert(key.to_string(), Entry { value, cached_at: Instant::now() });
    }

    fn invalidate(&self, key: &str) {
        self.cache.lock().remove(key);
    }
}

#[async_trait]
impl<S: StateStore> StateStore for CachingStateStore<S> {
    async fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
        if let Some(cached) = self.cached(key) {
            return Ok(cached);
        }
        let value = self.inner.get_raw(key).await?;
        self.store(key, value.clone());
        Ok(value)
    }

    async fn get_raw_fresh(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
        let value = self.inner.get_raw_fresh(key).await?;
        self.store(key, value.clone());
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<(), StateError> {
        self.inner.set_raw(key, value, ttl).await?;
        self.invalidate(key);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StateError> {
        self.inner.del(key).await?;
        self.invalidate(key);
        Ok(())
    }

    async fn set_if_absent_raw(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let created = self.inner.set_if_absent_raw(key, value, ttl).await?;
        if created {
            self.invalidate(key);
        }
        Ok(created)
    }

    async fn release_if_owner(&self, key: &str, identifier: &str) -> Result<bool, StateError> {
        let released = self.inner.release_if_owner(key, identifier).await?;
        if released {
            self.invalidate(key);
        }
        Ok(released)
    }
}

pub fn wrap<S: StateStore>(inner: S) -> Arc<CachingStateStore<S>> {
    Arc::new(CachingStateStore::new(inner))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingStore {
        reads: AtomicUsize,
        value: serde_json::Value,
    }

    #[async_trait]
    impl StateStore for CountingStore {
        async fn get_raw(&self, _key: &str) -> Result<Option<serde_json::Value>, StateError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(self.value.clone()))
        }

        async fn set_raw(&self, _key: &str, _value: serde_json::Value, _ttl: Option<Duration>) -> Result<(), StateError> {
            Ok(())
        }

        async fn del(&self, _key: &str) -> Result<(), StateError> {
            Ok(())
        }

        async fn set_if_absent_raw(
            &self,
            _key: &str,
            _value: serde_json::Value,
            _ttl: Duration,
        ) -> Result<bool, StateError> {
            Ok(true)
        }

        async fn release_if_owner(&self, _key: &str, _identifier: &str) -> Result<bool, StateError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn repeated_reads_within_ttl_hit_the_cache_once() {
        let inner = CountingStore { reads: AtomicUsize::new(0), value: serde_json::json!({"n": 1}) };
        let cached = CachingStateStore::with_ttl(inner, Duration::from_millis(200));

        cached.get_raw("k").await.unwrap();
        cached.get_raw("k").await.unwrap();
        cached.get_raw("k").await.unwrap();

        assert_eq!(cached.inner.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_read_always_bypasses_the_cache() {
        let inner = CountingStore { reads: AtomicUsize::new(0), value: serde_json::json!({"n": 1}) };
        let cached = CachingStateStore::with_ttl(inner, Duration::from_secs(30));

        cached.get_raw("k").await.unwrap();
        cached.get_raw_fresh("k").await.unwrap();
        cached.get_raw_fresh("k").await.unwrap();

        assert_eq!(cached.inner.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn writing_a_key_invalidates_its_cache_entry() {
        let inner = CountingStore { reads: AtomicUsize::new(0), value: serde_json::json!({"n": 1}) };
        let cached = CachingStateStore::with_ttl(inner, Duration::from_secs(30));

        cached.get_raw("k").await.unwrap();
        cached.set_raw("k", serde_json::json!({"n": 2}), None).await.unwrap();
        cached.get_raw("k").await.unwrap();

        assert_eq!(cached.inner.reads.load(Ordering::SeqCst), 2);
    }
}
