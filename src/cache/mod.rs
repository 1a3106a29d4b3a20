// src/cache/mod.rs

//! The caching layers shared by every analyzer.
//!
//! Every layer implements [`Cache`], so they stack freely: a scan wraps the
//! process-wide cache in a [`BatchCache`], which in turn writes into either a
//! [`DistributedCache`] or a plain [`TtlCache`]. The policy wrappers
//! ([`RefreshCache`], [`DisableCache`]) sit at the top of the stack when a
//! caller asks to bypass cached results.
//!
//! The cache stack is best-effort. Nothing in here panics and nothing in here
//! is allowed to fail a scan; failures travel as [`CacheError`] values and the
//! callers decide whether to care.

pub mod batch;
pub mod disable;
pub mod distributed;
pub mod max_memory;
pub mod memory;
pub mod refresh;
pub mod serializer;
pub mod single_flight;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use batch::BatchCache;
pub use disable::DisableCache;
pub use distributed::{DistributedCache, KeyValueStore, RedisStore, StoreError};
pub use max_memory::MaxMemoryMap;
pub use memory::TtlCache;
pub use refresh::RefreshCache;
pub use serializer::{JsonSerializer, Serializer};

/// Errors produced by the cache layers.
///
/// A [`CacheError::Miss`] is the expected outcome of most lookups and should
/// never be logged above `debug`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache miss for key: {0}")]
    Miss(String),

    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("circuit is open")]
    CircuitOpen,

    #[error("circuit is half open and trying")]
    CircuitHalfOpen,

    #[error("could not serialize cache value: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn miss(key: impl Into<String>) -> Self {
        CacheError::Miss(key.into())
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss(_))
    }

    /// True for every error that means "the backing store could not be
    /// reached". Breaker rejections count as unavailability for fallback
    /// purposes.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::Unavailable(_) | CacheError::CircuitOpen | CacheError::CircuitHalfOpen
        )
    }
}

/// The contract every cache layer implements.
#[async_trait]
pub trait Cache<T: Send + Sync + 'static>: Send + Sync {
    /// Returns the value for `key`, or [`CacheError::Miss`] if it is absent or expired.
    async fn get(&self, key: &str) -> Result<T, CacheError>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[async_trait]
impl<T, C> Cache<T> for Arc<C>
where
    T: Send + Sync + 'static,
    C: Cache<T> + ?Sized,
{
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }
}

/// The cache shared by analyzers and the scan driver.
pub type SharedCache = Arc<dyn Cache<CacheValue>>;

/// Values that know how to combine with a newer write to the same key.
///
/// Returning `None` means the two values are not combinable and the newer one
/// simply replaces the older one. Implementations return a fresh value and
/// leave `self` untouched, so a value handed out earlier never changes under
/// its reader.
pub trait Mergeable: Sized {
    fn merged_with(&self, newer: &Self) -> Option<Self>;
}

/// A value stored in the analyzer cache.
///
/// `Composite` values are field maps (typically rule id → serialized result)
/// and merge field by field. Everything else is a `Scalar` and is replaced
/// wholesale on conflicting writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum CacheValue {
    Scalar(serde_json::Value),
    Composite(BTreeMap<String, serde_json::Value>),
}

impl CacheValue {
    pub fn scalar(value: impl Into<serde_json::Value>) -> Self {
        CacheValue::Scalar(value.into())
    }

    pub fn as_composite(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
        match self {
            CacheValue::Composite(fields) => Some(fields),
            CacheValue::Scalar(_) => None,
        }
    }
}

impl<K, V> FromIterator<(K, V)> for CacheValue
where
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        CacheValue::Composite(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Mergeable for CacheValue {
    fn merged_with(&self, newer: &Self) -> Option<Self> {
        match (self, newer) {
            (CacheValue::Composite(existing), CacheValue::Composite(incoming)) => {
                let mut fields = existing.clone();
                fields.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(CacheValue::Composite(fields))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composites_merge_with_newer_fields_winning() {
        let old: CacheValue = [("a", json!(1)), ("b", json!(1))].into_iter().collect();
        let new: CacheValue = [("b", json!(2)), ("c", json!(3))].into_iter().collect();

        let merged = old.merged_with(&new).unwrap();
        let expected: CacheValue = [("a", json!(1)), ("b", json!(2)), ("c", json!(3))]
            .into_iter()
            .collect();
        assert_eq!(merged, expected);
        // the original is left alone
        assert_eq!(old.as_composite().unwrap().get("b"), Some(&json!(1)));
    }

    #[test]
    fn scalars_never_merge() {
        let composite: CacheValue = [("a", json!(1))].into_iter().collect();
        let scalar = CacheValue::scalar("x");

        assert!(scalar.merged_with(&CacheValue::scalar("y")).is_none());
        assert!(composite.merged_with(&scalar).is_none());
        assert!(scalar.merged_with(&composite).is_none());
    }

    #[test]
    fn breaker_rejections_count_as_unavailable() {
        assert!(CacheError::CircuitOpen.is_unavailable());
        assert!(CacheError::CircuitHalfOpen.is_unavailable());
        assert!(CacheError::Unavailable("down".into()).is_unavailable());
        assert!(!CacheError::miss("k").is_unavailable());
        assert!(CacheError::miss("k").is_miss());
    }
}
