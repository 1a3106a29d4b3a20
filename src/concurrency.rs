// src/concurrency.rs

//! Fan-out helpers and watchdogs shared by the scan driver and analyzer groups.

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, join_all};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

/// A spawned task that did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanic {
    pub message: String,
}

impl From<JoinError> for TaskPanic {
    fn from(e: JoinError) -> Self {
        let message = if e.is_panic() {
            panic_message(e.into_panic())
        } else {
            "task was cancelled".to_string()
        };
        Self { message }
    }
}

/// Extracts the text of a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

/// Runs every future on its own task and waits for all of them.
///
/// Results come back in input order. A panicking task does not affect its
/// siblings; it shows up as a [`TaskPanic`] in its slot.
pub async fn spawn_all<T: Send + 'static>(
    futures: Vec<BoxFuture<'static, T>>,
) -> Vec<Result<T, TaskPanic>> {
    let handles: Vec<JoinHandle<T>> = futures.into_iter().map(tokio::spawn).collect();
    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.map_err(TaskPanic::from))
        .collect()
}

/// Warns once if the guard is still alive after `threshold`. Never cancels.
pub struct WatchdogGuard {
    handle: JoinHandle<()>,
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn watchdog(name: impl Into<String>, threshold: Duration) -> WatchdogGuard {
    let name = name.into();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(threshold).await;
        warn!(task = %name, threshold_ms = threshold.as_millis() as u64, "Task is still running.");
    });
    WatchdogGuard { handle }
}

/// Awaits `future`, warning while it runs past `threshold` and once more
/// with the total time when it finally completes.
pub async fn log_long_running<F: Future>(name: &str, threshold: Duration, future: F) -> F::Output {
    let started = Instant::now();
    let guard = watchdog(name, threshold);
    let output = future.await;
    drop(guard);

    let elapsed = started.elapsed();
    if elapsed > threshold {
        warn!(task = name, elapsed_ms = elapsed.as_millis() as u64, "Long running task finished.");
    }
    output
}
