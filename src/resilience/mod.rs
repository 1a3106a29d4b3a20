// src/resilience/mod.rs

//! Guards around unreliable calls.

pub mod circuit_breaker;

use std::time::Duration;

use futures_util::future::BoxFuture;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitError};

/// Source of timed waits, injectable so cool-downs can be driven by tests.
pub trait Clock: Send + Sync {
    /// Returns a future that completes once `duration` has passed.
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The runtime clock, backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
