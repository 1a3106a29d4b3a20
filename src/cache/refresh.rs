// src/cache/refresh.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Cache, CacheError};

/// Forces fresh results while still repopulating the wrapped cache.
pub struct RefreshCache<T> {
    inner: Arc<dyn Cache<T>>,
}

impl<T: Send + Sync + 'static> RefreshCache<T> {
    pub fn new(inner: Arc<dyn Cache<T>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Cache<T> for RefreshCache<T> {
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        Err(CacheError::miss(key))
    }

    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }
}
