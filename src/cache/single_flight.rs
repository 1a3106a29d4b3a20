// src/cache/single_flight.rs

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::debug;

use super::CacheError;

type InFlight<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// Collapses concurrent lookups of the same key into one underlying call.
///
/// The first caller for a key starts the work; every caller that arrives
/// while it is still running awaits the same shared future and receives a
/// clone of its result. The entry is removed once the call completes or its
/// last caller gives up, so the next lookup after that starts fresh.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, (u64, InFlight<T>)>>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn run<F>(&self, key: &str, make: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, CacheError>>,
    {
        let (id, call) = {
            let mut calls = self.lock();
            match calls.get(key) {
                Some((id, call)) => {
                    debug!(key, "Joining in-flight lookup.");
                    (*id, call.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let call = make().shared();
                    calls.insert(key.to_string(), (id, call.clone()));
                    (id, call)
                }
            }
        };

        let mut waiter = Waiter {
            flight: self,
            key,
            id,
            call: Some(call),
        };
        match waiter.call.as_mut() {
            Some(call) => call.await,
            None => Err(CacheError::miss(key)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, InFlight<T>)>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

/// One caller's handle on a shared call.
///
/// Dropping it, whether the call finished or the caller was cancelled,
/// removes the map entry once the call is done or no other caller waits on it.
struct Waiter<'a, T: Clone + Send + Sync + 'static> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
    id: u64,
    call: Option<InFlight<T>>,
}

impl<T: Clone + Send + Sync + 'static> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        // release our handle before counting the remaining ones
        self.call = None;

        let mut calls = self.flight.lock();
        let done = match calls.get(self.key) {
            // a newer call may already occupy the slot
            Some((current, call)) if *current == self.id => {
                call.peek().is_some() || call.strong_count().is_none_or(|count| count <= 1)
            }
            _ => false,
        };
        if done {
            calls.remove(self.key);
        }
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
