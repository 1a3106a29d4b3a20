// src/cache/max_memory.rs

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

struct MapEntry<V> {
    value: V,
    last_used: u64,
    memory_size: usize,
}

struct Inner<K, V> {
    entries: HashMap<K, MapEntry<V>>,
    current_memory_size: usize,
    /// Logical clock for last access. Strictly increasing, so two entries
    /// never share a stamp and eviction order is deterministic.
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_oldest(&mut self) -> Option<usize> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        let entry = self.entries.remove(&oldest)?;
        self.current_memory_size -= entry.memory_size;
        Some(entry.memory_size)
    }
}

/// A key/value store capped by the approximate serialized size of its values.
///
/// Sizes are measured as the length of the value's JSON encoding. When a
/// write pushes the total above the configured maximum, the least recently
/// used entries are evicted until the total fits again. The map is
/// best-effort: a value that cannot be measured is silently not stored.
pub struct MaxMemoryMap<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_memory_size: usize,
}

impl<K, V> MaxMemoryMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Serialize + Clone,
{
    pub fn new(max_memory_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                current_memory_size: 0,
                tick: 0,
            }),
            max_memory_size,
        }
    }

    /// Returns a clone of the value and marks the entry as recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let tick = inner.next_tick();
        let entry = inner.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    pub fn set(&self, key: K, value: V) {
        let memory_size = match serde_json::to_vec(&value) {
            Ok(encoded) => encoded.len(),
            Err(e) => {
                debug!(error = %e, "Could not measure value, not caching it.");
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let last_used = inner.next_tick();
        if let Some(previous) = inner.entries.insert(
            key,
            MapEntry {
                value,
                last_used,
                memory_size,
            },
        ) {
            inner.current_memory_size -= previous.memory_size;
        }
        inner.current_memory_size += memory_size;

        // Cleanup runs inside the same critical section as the insert, so it
        // can never overlap with another cleanup.
        if inner.current_memory_size > self.max_memory_size {
            self.clean_up(&mut inner);
        }
    }

    fn clean_up(&self, inner: &mut Inner<K, V>) {
        let mut evicted = 0usize;
        while inner.current_memory_size > self.max_memory_size {
            if inner.evict_oldest().is_none() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                evicted,
                remaining = inner.entries.len(),
                memory_size = inner.current_memory_size,
                "Evicted least recently used entries."
            );
        }
        if inner.current_memory_size > self.max_memory_size {
            warn!(
                memory_size = inner.current_memory_size,
                max = self.max_memory_size,
                "Memory map still over budget after cleanup."
            );
        }
    }

    /// Total tracked size of every stored value, in bytes.
    pub fn memory_size(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .current_memory_size
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_memory_size(&self) -> usize {
        self.max_memory_size
    }
}
