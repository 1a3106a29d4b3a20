// src/cache/memory.rs

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{Cache, CacheError};

struct Entry<T> {
    value: T,
    /// `None` never expires.
    expires_at: Option<Instant>,
}

/// A single-process cache with per-entry expiry.
///
/// Used on its own when no distributed store is configured, and as the fast
/// local tier in front of [`DistributedCache`](super::DistributedCache).
/// Expiry is lazy: an expired entry is removed by the read that finds it.
pub struct TtlCache<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &str) -> Result<T, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired = match entries.get(key) {
            None => return Err(CacheError::miss(key)),
            Some(entry) => entry.expires_at.is_some_and(|at| Instant::now() >= at),
        };
        if expired {
            debug!(key, "Cache entry expired.");
            entries.remove(key);
            return Err(CacheError::miss(key));
        }
        entries
            .get(key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| CacheError::miss(key))
    }

    /// Stores `value` until the absolute instant `expires_at`.
    pub fn set_until(&self, key: &str, value: T, expires_at: Instant) {
        self.store(key, value, Some(expires_at));
    }

    /// Synchronous write used by layers that must not await on their own tier.
    ///
    /// A `ttl` too large to represent as an instant keeps the entry forever.
    pub fn insert(&self, key: &str, value: T, ttl: Duration) {
        self.store(key, value, Instant::now().checked_add(ttl));
    }

    fn store(&self, key: &str, value: T, expires_at: Option<Instant>) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), Entry { value, expires_at });
    }

    pub fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Cache<T> for TtlCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        self.lookup(key)
    }

    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key);
        Ok(())
    }
}
