//! Durable state for the bot: the envelope KV store and the distributed lock
//! that guards maintenance runs (spec.md §4.3).

pub mod cache;
pub mod error;
pub mod lock;
pub mod redis_store;
pub mod store;

pub use cache::CachingStateStore;
pub use error::StateError;
pub use lock::{DistributedLock, LockGuard};
pub use redis_store::RedisStateStore;
pub use store::{StateStore, StateStoreExt};
