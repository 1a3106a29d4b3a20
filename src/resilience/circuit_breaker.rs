// src/resilience/circuit_breaker.rs

//! A three-state circuit breaker.
//!
//! ```text
//! Closed    → Open:      consecutive failures reach the threshold
//! Open      → Half-Open: the cool-down elapsed
//! Half-Open → Closed:    the single trial call succeeded
//! Half-Open → Open:      the trial call failed, cool-down restarts
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::{Clock, TokioClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError<E> {
    #[error("circuit is open")]
    Open,

    #[error("circuit is half open and trying")]
    HalfOpenBusy,

    #[error("{0}")]
    Inner(E),
}

struct Status {
    state: BreakerState,
    failures: u32,
    trial_in_flight: bool,
    /// Bumped every time the breaker opens. A cool-down only applies to the
    /// cycle it was started for.
    epoch: u64,
}

struct Inner {
    name: String,
    status: Mutex<Status>,
    clock: Arc<dyn Clock>,
    failure_threshold: u32,
    cool_down: Duration,
}

/// Shared handle to one breaker. Clones observe and drive the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

/// Clears the trial flag if the trial future is dropped before finishing.
struct TrialGuard<'a> {
    inner: Option<&'a Inner>,
}

impl TrialGuard<'_> {
    fn release(mut self) {
        self.inner = None;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner {
            let mut status = inner.status.lock().unwrap_or_else(|p| p.into_inner());
            status.trial_in_flight = false;
            debug!(breaker = %inner.name, "Trial call dropped before completion.");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cool_down: Duration) -> Self {
        Self::with_clock(name, failure_threshold, cool_down, Arc::new(TokioClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        failure_threshold: u32,
        cool_down: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                status: Mutex::new(Status {
                    state: BreakerState::Closed,
                    failures: 0,
                    trial_in_flight: false,
                    epoch: 0,
                }),
                clock,
                failure_threshold: failure_threshold.max(1),
                cool_down,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Runs `f` if the breaker admits the call and records its outcome.
    ///
    /// # Returns
    ///
    /// The call's own result wrapped in [`CircuitError::Inner`] on failure,
    /// or a rejection when the breaker is open or a trial is already running.
    pub async fn run<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_trial = self.admit()?;
        let guard = TrialGuard {
            inner: is_trial.then_some(&*self.inner),
        };

        let result = f().await;
        guard.release();

        match result {
            Ok(value) => {
                self.on_success(is_trial);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(is_trial);
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Status> {
        self.inner.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns whether the admitted call is the half-open trial.
    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let mut status = self.lock();
        match status.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                debug!(breaker = %self.inner.name, "Rejecting call, circuit is open.");
                Err(CircuitError::Open)
            }
            BreakerState::HalfOpen if status.trial_in_flight => Err(CircuitError::HalfOpenBusy),
            BreakerState::HalfOpen => {
                status.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self, is_trial: bool) {
        let mut status = self.lock();
        status.failures = 0;
        if is_trial {
            status.trial_in_flight = false;
            if status.state == BreakerState::HalfOpen {
                status.state = BreakerState::Closed;
                debug!(breaker = %self.inner.name, "Trial succeeded, circuit closed.");
            }
        }
    }

    fn on_failure(&self, is_trial: bool) {
        let mut status = self.lock();
        if is_trial {
            status.trial_in_flight = false;
            if status.state == BreakerState::HalfOpen {
                warn!(breaker = %self.inner.name, "Trial failed, circuit open again.");
                let epoch = Self::open(&mut status);
                drop(status);
                self.start_cool_down(epoch);
            }
            return;
        }

        status.failures += 1;
        if status.state == BreakerState::Closed && status.failures >= self.inner.failure_threshold {
            warn!(
                breaker = %self.inner.name,
                failures = status.failures,
                cool_down = ?self.inner.cool_down,
                "Failure threshold reached, circuit open."
            );
            let epoch = Self::open(&mut status);
            drop(status);
            self.start_cool_down(epoch);
        }
    }

    fn open(status: &mut Status) -> u64 {
        status.state = BreakerState::Open;
        status.epoch += 1;
        status.epoch
    }

    fn start_cool_down(&self, epoch: u64) {
        let inner = self.inner.clone();
        let wait = inner.clock.after(inner.cool_down);
        tokio::spawn(async move {
            wait.await;
            let mut status = inner.status.lock().unwrap_or_else(|p| p.into_inner());
            if status.state == BreakerState::Open && status.epoch == epoch {
                status.state = BreakerState::HalfOpen;
                debug!(breaker = %inner.name, "Cool-down elapsed, circuit half open.");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, oneshot};

    /// Cool-downs complete only when the test calls `elapse`.
    #[derive(Default)]
    struct FakeClock {
        notify: Arc<Notify>,
    }

    impl FakeClock {
        fn elapse(&self) {
            self.notify.notify_one();
        }
    }

    impl Clock for FakeClock {
        fn after(&self, _duration: Duration) -> BoxFuture<'static, ()> {
            let notify = self.notify.clone();
            Box::pin(async move { notify.notified().await })
        }
    }

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::default());
        let breaker =
            CircuitBreaker::with_clock("test", threshold, Duration::from_secs(30), clock.clone());
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.run(|| async { Err("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.run(|| async { Ok(()) }).await
    }

    async fn wait_for_state(breaker: &CircuitBreaker, expected: BreakerState) {
        for _ in 0..100 {
            if breaker.state() == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), expected);
    }

    async fn open_then_half_open(breaker: &CircuitBreaker, clock: &FakeClock) {
        fail(breaker).await.unwrap_err();
        fail(breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
        clock.elapse();
        wait_for_state(breaker, BreakerState::HalfOpen).await;
    }

    #[tokio::test]
    async fn opens_at_the_threshold() {
        let (breaker, _clock) = breaker(2);

        assert_eq!(fail(&breaker).await, Err(CircuitError::Inner("boom")));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);

        assert_eq!(fail(&breaker).await, Err(CircuitError::Inner("boom")));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling() {
        let (breaker, _clock) = breaker(2);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        let calls = AtomicUsize::new(0);
        let result: Result<(), CircuitError<&str>> = breaker
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result, Err(CircuitError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_opens_after_cool_down_and_closes_on_trial_success() {
        let (breaker, clock) = breaker(2);
        open_then_half_open(&breaker, &clock).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_restarts_cool_down() {
        let (breaker, clock) = breaker(2);
        open_then_half_open(&breaker, &clock).await;

        assert_eq!(fail(&breaker).await, Err(CircuitError::Inner("boom")));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(succeed(&breaker).await, Err(CircuitError::Open));

        clock.elapse();
        wait_for_state(&breaker, BreakerState::HalfOpen).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let (breaker, _clock) = breaker(2);
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn only_one_trial_runs_at_a_time() {
        let (breaker, clock) = breaker(2);
        open_then_half_open(&breaker, &clock).await;

        let (release, released) = oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .run(|| async move {
                        let _ = released.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(succeed(&breaker).await, Err(CircuitError::HalfOpenBusy));

        release.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), Ok(()));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn dropped_trial_frees_the_slot() {
        let (breaker, clock) = breaker(2);
        open_then_half_open(&breaker, &clock).await;

        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .run(|| std::future::pending::<Result<(), &str>>())
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        trial.abort();
        let _ = trial.await;

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
