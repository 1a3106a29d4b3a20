// src/cache/batch.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Cache, CacheError, Mergeable};

struct Buffered<T> {
    value: T,
    ttl: Duration,
}

/// Per-scan write buffer in front of a real cache.
///
/// Reads go straight to the wrapped cache. Writes are held back until
/// [`BatchCache::flush`]; two writes to the same key are merged when the
/// values support it (keeping the shorter ttl) and otherwise the later write
/// wins. This lets several analyzers contribute fields to one cache entry
/// without racing each other on the backend.
pub struct BatchCache<T> {
    inner: Arc<dyn Cache<T>>,
    buffer: Mutex<HashMap<String, Buffered<T>>>,
}

impl<T> BatchCache<T>
where
    T: Mergeable + Clone + Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn Cache<T>>) -> Self {
        Self {
            inner,
            buffer: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Buffered<T>>> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Writes every buffered entry to the wrapped cache.
    ///
    /// Stops at the first failing write and returns its error. Entries are
    /// taken out of the buffer up front, so a failed flush does not leave them
    /// behind for a second attempt.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let entries: Vec<(String, Buffered<T>)> = self.lock().drain().collect();
        let total = entries.len();

        for (written, (key, entry)) in entries.into_iter().enumerate() {
            if let Err(e) = self.inner.set(&key, entry.value, entry.ttl).await {
                warn!(
                    key = %key,
                    written,
                    total,
                    error = %e,
                    "Flushing batched cache writes failed."
                );
                return Err(e);
            }
        }

        debug!(total, "Flushed batched cache writes.");
        Ok(())
    }
}

#[async_trait]
impl<T> Cache<T> for BatchCache<T>
where
    T: Mergeable + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<T, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError> {
        let mut buffer = self.lock();
        let merged = buffer.get(key).and_then(|existing| {
            existing
                .value
                .merged_with(&value)
                .map(|merged| Buffered {
                    value: merged,
                    ttl: existing.ttl.min(ttl),
                })
        });
        buffer.insert(
            key.to_string(),
            merged.unwrap_or(Buffered { value, ttl }),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheValue, TtlCache};
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);
    const HALF_HOUR: Duration = Duration::from_secs(1800);

    /// Records every write and can be told to fail after a number of them.
    #[derive(Default)]
    struct RecordingCache {
        writes: Mutex<Vec<(String, CacheValue, Duration)>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Cache<CacheValue> for RecordingCache {
        async fn get(&self, key: &str) -> Result<CacheValue, CacheError> {
            Err(CacheError::miss(key))
        }

        async fn set(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<(), CacheError> {
            let mut writes = self.writes.lock().unwrap();
            if self.fail_after.is_some_and(|limit| writes.len() >= limit) {
                return Err(CacheError::Unavailable("down".into()));
            }
            writes.push((key.to_string(), value, ttl));
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn composites_merge_and_keep_the_shorter_ttl() {
        let recorder = Arc::new(RecordingCache::default());
        let batch: BatchCache<CacheValue> = BatchCache::new(recorder.clone());

        let a: CacheValue = [("a", json!(1))].into_iter().collect();
        let b: CacheValue = [("b", json!(2))].into_iter().collect();
        batch.set("example.com", a, HOUR).await.unwrap();
        batch.set("example.com", b, HALF_HOUR).await.unwrap();

        assert!(recorder.writes.lock().unwrap().is_empty());
        batch.flush().await.unwrap();

        let writes = recorder.writes.lock().unwrap();
        let expected: CacheValue = [("a", json!(1)), ("b", json!(2))].into_iter().collect();
        assert_eq!(
            *writes,
            vec![("example.com".to_string(), expected, HALF_HOUR)]
        );
    }

    #[tokio::test]
    async fn scalars_are_overwritten() {
        let recorder = Arc::new(RecordingCache::default());
        let batch: BatchCache<CacheValue> = BatchCache::new(recorder.clone());

        batch.set("k", CacheValue::scalar("x"), HOUR).await.unwrap();
        batch.set("k", CacheValue::scalar("y"), HOUR).await.unwrap();
        batch.flush().await.unwrap();

        let writes = recorder.writes.lock().unwrap();
        assert_eq!(*writes, vec![("k".to_string(), CacheValue::scalar("y"), HOUR)]);
    }

    #[tokio::test]
    async fn flush_stops_at_the_first_failure() {
        let recorder = Arc::new(RecordingCache {
            fail_after: Some(1),
            ..RecordingCache::default()
        });
        let batch: BatchCache<CacheValue> = BatchCache::new(recorder.clone());
        for key in ["a", "b", "c"] {
            batch.set(key, CacheValue::scalar(key), HOUR).await.unwrap();
        }

        let err = batch.flush().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(recorder.writes.lock().unwrap().len(), 1);
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test]
    async fn reads_pass_through_and_deletes_drop_buffered_writes() {
        let inner = Arc::new(TtlCache::<CacheValue>::new());
        inner
            .set("seen", CacheValue::scalar(1), HOUR)
            .await
            .unwrap();
        let batch: BatchCache<CacheValue> = BatchCache::new(inner.clone());

        assert_eq!(batch.get("seen").await, Ok(CacheValue::scalar(1)));

        batch.set("new", CacheValue::scalar(2), HOUR).await.unwrap();
        // buffered writes are not visible until flushed
        assert!(batch.get("new").await.unwrap_err().is_miss());

        batch.delete("new").await.unwrap();
        batch.flush().await.unwrap();
        assert!(inner.get("new").await.unwrap_err().is_miss());
    }
}
