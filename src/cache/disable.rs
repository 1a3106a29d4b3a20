// src/cache/disable.rs

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

use super::{Cache, CacheError};

/// A cache that never stores anything.
pub struct DisableCache<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> DisableCache<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for DisableCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Cache<T> for DisableCache<T> {
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        Err(CacheError::miss(key))
    }

    async fn set(&self, _key: &str, _value: T, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
