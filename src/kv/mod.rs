//! Key-value store abstraction.
//!
//! All gateway state (sessions, CSRF tokens, login state, rate-limit
//! counters, policies, the audit queue) lives behind the [`Kv`] trait:
//! string values with hard-expiry TTLs, atomic increment, list operations,
//! and a pattern scan reserved for admin/cleanup paths.
//!
//! Two implementations:
//!
//! - [`RedisKv`] — the production store, a shared connection manager.
//! - [`MemoryKv`] — in-process store for tests and local development, with
//!   lazy expiry eviction on access.

mod memory;
mod redis_store;

pub use memory::MemoryKv;
pub use redis_store::RedisKv;

use std::time::Duration;

use crate::Result;

/// Storage backend for all gateway state.
///
/// Implementations must be `Send + Sync`: the store is shared across
/// request tasks.
#[async_trait::async_trait]
pub trait Kv: Send + Sync + 'static {
    /// Get the string value at `key`, or `None` if absent/expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value`, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set `key` only if it already exists (atomic update-not-create).
    ///
    /// Returns `false` when the key is absent. This is how activity bumps
    /// lose to a concurrent delete: a destroyed record is never re-created.
    async fn set_if_exists(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Delete `keys`; returns the number removed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// True if `key` exists and is not expired.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically increment the integer at `key` (creating it at 0).
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically increment `key` and set its TTL in one round trip.
    ///
    /// This is the rate-limiter primitive: the first request in a window
    /// creates the counter with an expiry; later requests re-arm the TTL,
    /// which is harmless because window keys embed the window number.
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Set the TTL on an existing key; returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Scan keys matching a glob `pattern`. O(n); admin/cleanup paths only.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Push `value` to the head of the list at `key`; returns new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<u64>;

    /// Read list elements `start..=stop` (negative indexes from the tail).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Pop from the tail of the list at `key`.
    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    /// Length of the list at `key`.
    async fn llen(&self, key: &str) -> Result<u64>;

    /// Trim the list at `key` to `start..=stop`.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Liveness probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// Delete a single key. Convenience over [`Kv::del`].
pub async fn del_one(kv: &dyn Kv, key: &str) -> Result<u64> {
    kv.del(&[key.to_string()]).await
}
