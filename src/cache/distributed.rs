// src/cache/distributed.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::single_flight::SingleFlight;
use super::{Cache, CacheError, JsonSerializer, Serializer, TtlCache};
use crate::resilience::{CircuitBreaker, CircuitError};

/// Longest expiry redis accepts; longer ones are stored without expiry.
const MAX_EXPIRE_SECS: u64 = i64::MAX as u64 / 1000;

/// How long a value fetched from the backend stays in the local tier.
pub const LOCAL_TIER_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Backend(String),
}

/// A remote byte store with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// [`KeyValueStore`] backed by Redis through a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        info!(url, "Connected to redis.");
        Ok(Self { connection })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        // redis rejects an expiry of zero seconds, and one past its own limit
        let seconds = ttl.as_secs().max(1);
        if seconds > MAX_EXPIRE_SECS {
            let _: () = connection.set(key, value).await?;
        } else {
            let _: () = connection.set_ex(key, value, seconds).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(key).await?;
        Ok(())
    }
}

/// Two-tier cache: a local [`TtlCache`] in front of a remote store.
///
/// Remote calls go through a [`CircuitBreaker`], and concurrent misses for the
/// same key share one remote lookup. A payload that cannot be decoded is
/// treated as a miss.
pub struct DistributedCache<T> {
    store: Arc<dyn KeyValueStore>,
    local: Arc<TtlCache<T>>,
    breaker: CircuitBreaker,
    flight: SingleFlight<T>,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> DistributedCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn KeyValueStore>, breaker: CircuitBreaker) -> Self {
        Self::with_serializer(store, breaker, Arc::new(JsonSerializer::new()))
    }
}

impl<T> DistributedCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_serializer(
        store: Arc<dyn KeyValueStore>,
        breaker: CircuitBreaker,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        Self {
            store,
            local: Arc::new(TtlCache::new()),
            breaker,
            flight: SingleFlight::new(),
            serializer,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

fn rejection(e: CircuitError<StoreError>) -> CacheError {
    match e {
        CircuitError::Open => CacheError::CircuitOpen,
        CircuitError::HalfOpenBusy => CacheError::CircuitHalfOpen,
        CircuitError::Inner(e) => {
            warn!(error = %e, "Cache backend call failed.");
            CacheError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl<T> Cache<T> for DistributedCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        if let Ok(value) = self.local.get(key).await {
            return Ok(value);
        }

        let store = self.store.clone();
        let local = self.local.clone();
        let breaker = self.breaker.clone();
        let serializer = self.serializer.clone();
        let key_owned = key.to_string();

        self.flight
            .run(key, move || {
                async move {
                    let key = key_owned;
                    // another lookup may have filled the local tier meanwhile
                    if let Ok(value) = local.get(&key).await {
                        return Ok(value);
                    }

                    let bytes = match breaker.run(|| store.get(&key)).await {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => {
                            debug!(key = %key, "Cache miss in backend.");
                            return Err(CacheError::miss(key));
                        }
                        Err(e) => return Err(rejection(e)),
                    };

                    match serializer.deserialize(&bytes) {
                        Ok(value) => {
                            local.insert(&key, value.clone(), LOCAL_TIER_TTL);
                            Ok(value)
                        }
                        Err(e) => {
                            debug!(
                                key = %key,
                                error = %e,
                                "Undecodable cache payload, treating as miss."
                            );
                            Err(CacheError::miss(key))
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError> {
        let bytes = self.serializer.serialize(&value)?;
        self.local.insert(key, value, ttl);
        self.breaker
            .run(|| self.store.set(key, bytes, ttl))
            .await
            .map_err(rejection)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.local.remove(key);
        self.breaker
            .run(|| self.store.delete(key))
            .await
            .map_err(rejection)
    }
}
