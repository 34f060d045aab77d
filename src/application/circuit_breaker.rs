//! Circuit breaker for registry mutations.
//!
//! A three-state breaker (closed, open, half-open) that stops calling an
//! operation once it keeps failing and lets trial calls through after a timeout.
//!
//! State changes start a new *generation*. An outcome reported for a call
//! that started in an earlier generation is ignored, so a slow call from
//! before a transition can never flip the state it no longer belongs to.

use crate::application::metrics::Metrics;
use crate::application::ports::Clock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and outcomes are counted
    Closed,
    /// Calls are rejected until the timeout elapses
    Open,
    /// A limited number of trial calls pass
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time spent open before probing
    pub timeout_ms: u64,
    /// Trial calls allowed while half-open
    pub max_requests: u32,
    /// Period after which closed-state counts are cleared; 0 disables
    pub interval_ms: u64,
    /// Requests observed before `failure_ratio` applies; 0 disables the ratio
    pub min_requests: u32,
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            max_requests: 3,
            interval_ms: 60_000,
            min_requests: 10,
            failure_ratio: 0.6,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if self.success_threshold == 0 {
            return Err(BreakerConfigError::ZeroSuccessThreshold);
        }
        if self.success_threshold > self.max_requests {
            return Err(BreakerConfigError::SuccessThresholdAboveMaxRequests {
                success_threshold: self.success_threshold,
                max_requests: self.max_requests,
            });
        }
        if self.min_requests > 0 && !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(BreakerConfigError::InvalidFailureRatio(self.failure_ratio));
        }
        Ok(())
    }
}

/// Invalid circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BreakerConfigError {
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    #[error("success_threshold must be at least 1")]
    ZeroSuccessThreshold,
    #[error(
        "success_threshold ({success_threshold}) cannot exceed max_requests ({max_requests})"
    )]
    SuccessThresholdAboveMaxRequests {
        success_threshold: u32,
        max_requests: u32,
    },
    #[error("failure_ratio must be in (0, 1], got {0}")]
    InvalidFailureRatio(f64),
}

/// Result of a breaker-wrapped call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not invoked
    #[error("circuit breaker is open")]
    Open,
    /// The half-open trial quota is used up; the operation was not invoked
    #[error("too many requests while circuit breaker is half-open")]
    TooManyRequests,
    /// The operation ran and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker refused the call itself.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Inner(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(err) => Some(err),
            _ => None,
        }
    }
}

/// Outcome counters for the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counts {
    pub requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_successes: u64,
    pub consecutive_failures: u64,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// When the current generation ends: interval in closed, timeout in open
    expiry: Option<Instant>,
}

/// Circuit breaker guarding one operation class.
///
/// All state sits behind one mutex that is never held while the wrapped
/// operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker after validating `config`.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, clock, metrics))
    }

    pub(crate) fn from_validated(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        let expiry = closed_expiry(&config, clock.now());
        Self {
            name,
            config,
            clock,
            metrics,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout has passed reads as half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, self.clock.now());
        inner.state
    }

    /// Counts for the current generation.
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.refresh(&mut inner, self.clock.now());
        inner.counts
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner, self.clock.now());
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            generation: inner.generation,
            counts: inner.counts,
        }
    }

    /// Force the breaker closed with fresh counts.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.state == CircuitState::Closed {
            self.new_generation(&mut inner, now);
        } else {
            self.transition(&mut inner, CircuitState::Closed, now);
        }
    }

    /// Run `f` if the breaker permits it and record its outcome.
    ///
    /// Any `Err` from `f` counts as a failure. A panic in `f` is recorded as
    /// a failure before it propagates.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.execute_with(f, |_| true)
    }

    /// Like [`execute`](Self::execute), but only errors for which
    /// `is_failure` returns true count against the breaker.
    ///
    /// Other errors are recorded as successes: the operation answered, the
    /// request was just wrong.
    pub fn execute_with<T, E, F, P>(&self, f: F, is_failure: P) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        P: FnOnce(&E) -> bool,
    {
        let call = self.begin()?;
        let result = f();
        let success = match &result {
            Ok(_) => true,
            Err(err) => !is_failure(err),
        };
        call.finish(success);
        result.map_err(BreakerError::Inner)
    }

    /// Whether nothing has gone wrong in the current generation.
    ///
    /// An idle breaker is closed and has recorded no failures, so dropping
    /// it loses no information.
    pub fn is_idle(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, self.clock.now());
        inner.state == CircuitState::Closed && inner.counts.total_failures == 0
    }

    /// Async counterpart of [`execute`](Self::execute).
    ///
    /// A future dropped before completing is recorded as a failure.
    pub async fn execute_async<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let call = self.begin()?;
        let result = f().await;
        call.finish(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin<E>(&self) -> Result<Call<'_>, BreakerError<E>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Open => Err(BreakerError::Open),
            CircuitState::HalfOpen
                if inner.counts.requests >= u64::from(self.config.max_requests) =>
            {
                Err(BreakerError::TooManyRequests)
            }
            _ => {
                inner.counts.on_request();
                Ok(Call {
                    breaker: self,
                    generation: inner.generation,
                    finished: false,
                })
            }
        }
    }

    fn record(&self, generation: u64, success: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.on_success();
            if inner.state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= u64::from(self.config.success_threshold)
            {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            let trip = match inner.state {
                CircuitState::Closed => self.ready_to_trip(&inner.counts),
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if trip {
                self.transition(&mut inner, CircuitState::Open, now);
            }
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        if counts.consecutive_failures >= u64::from(self.config.failure_threshold) {
            return true;
        }
        let min = u64::from(self.config.min_requests);
        min > 0
            && counts.requests >= min
            && counts.total_failures as f64 / counts.requests as f64 >= self.config.failure_ratio
    }

    /// Apply time-based changes: interval rollover in closed, timeout in open.
    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            CircuitState::Closed if expired => self.new_generation(inner, now),
            CircuitState::Open if expired => {
                self.transition(inner, CircuitState::HalfOpen, now)
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);

        if to == CircuitState::Open {
            self.metrics.record_breaker_trip();
            warn!(breaker = %self.name, %from, %to, "circuit breaker opened");
        } else {
            info!(breaker = %self.name, %from, %to, "circuit breaker state changed");
        }
    }

    fn new_generation(&self, inner: &mut BreakerState, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => closed_expiry(&self.config, now),
            CircuitState::Open => Some(now + self.config.timeout()),
            CircuitState::HalfOpen => None,
        };
    }
}

fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    (config.interval_ms > 0).then(|| now + config.interval())
}

/// An admitted call whose outcome has not been recorded yet.
///
/// Dropping it unfinished (panic or cancelled future) records a failure.
struct Call<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl Call<'_> {
    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker.record(self.generation, success);
    }
}

impl Drop for Call<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.record(self.generation, false);
        }
    }
}

/// Shareable circuit breaker reference.
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::cell::Cell;
    use std::thread;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, MockClock) {
        let clock = MockClock::new(Instant::now());
        let cb = CircuitBreaker::new("test", config, Arc::new(clock.clone()), Metrics::new())
            .unwrap();
        (cb, clock)
    }

    fn config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            timeout_ms: 1000,
            max_requests: 1,
            interval_ms: 0,
            min_requests: 0,
            ..Default::default()
        }
    }

    fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| Err::<(), _>("boom"))
    }

    fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| Ok::<(), &str>(()))
    }

    #[test]
    fn test_initial_state() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());
        assert_eq!(cb.execute(|| Ok::<_, ()>(42)), Ok(42));
    }

    #[test]
    fn test_inner_error_passes_through() {
        let (cb, _) = breaker(config(5));
        assert_eq!(fail(&cb), Err(BreakerError::Inner("boom")));
        let counts = cb.counts();
        assert_eq!(counts.requests, 1);
        assert_eq!(counts.total_failures, 1);
    }

    #[test]
    fn test_failure_threshold_opens_and_short_circuits() {
        let (cb, _) = breaker(config(3));
        for _ in 0..3 {
            assert_eq!(fail(&cb), Err(BreakerError::Inner("boom")));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = Cell::new(false);
        let result = cb.execute(|| {
            invoked.set(true);
            Ok::<(), ()>(())
        });
        assert_eq!(result, Err(BreakerError::Open));
        assert!(!invoked.get());
    }

    #[test]
    fn test_execute_with_ignores_non_failures() {
        let (cb, _) = breaker(config(1));
        let result = cb.execute_with(|| Err::<(), _>("bad request"), |err| *err != "bad request");
        assert_eq!(result, Err(BreakerError::Inner("bad request")));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_idle());
        assert_eq!(cb.counts().total_successes, 1);

        let result = cb.execute_with(|| Err::<(), _>("down"), |err| *err != "bad request");
        assert_eq!(result, Err(BreakerError::Inner("down")));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_idle());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (cb, _) = breaker(config(3));
        fail(&cb).unwrap_err();
        fail(&cb).unwrap_err();
        succeed(&cb).unwrap();
        fail(&cb).unwrap_err();
        fail(&cb).unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().consecutive_failures, 2);
    }

    #[test]
    fn test_timeout_moves_to_half_open_and_invokes() {
        let (cb, clock) = breaker(config(1));
        fail(&cb).unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(999));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let invoked = Cell::new(false);
        cb.execute(|| {
            invoked.set(true);
            Ok::<(), ()>(())
        })
        .unwrap();
        assert!(invoked.get());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_timeout() {
        let (cb, clock) = breaker(config(1));
        fail(&cb).unwrap_err();
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(500));
        assert_eq!(succeed(&cb), Err(BreakerError::Open));
        clock.advance(Duration::from_millis(500));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_needs_success_threshold() {
        let (cb, clock) = breaker(CircuitBreakerConfig {
            success_threshold: 2,
            max_requests: 3,
            ..config(1)
        });
        fail(&cb).unwrap_err();
        clock.advance(Duration::from_secs(1));

        succeed(&cb).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[test]
    fn test_half_open_quota() {
        let (cb, clock) = breaker(config(1));
        fail(&cb).unwrap_err();
        clock.advance(Duration::from_secs(1));

        // The only trial slot is taken by the outer call
        let nested = cb
            .execute(|| Ok::<_, ()>(succeed(&cb)))
            .unwrap();
        assert_eq!(nested, Err(BreakerError::TooManyRequests));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failure_ratio_trips() {
        let (cb, _) = breaker(CircuitBreakerConfig {
            min_requests: 4,
            failure_ratio: 0.5,
            ..config(10)
        });
        succeed(&cb).unwrap();
        fail(&cb).unwrap_err();
        succeed(&cb).unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_interval_clears_closed_counts() {
        let (cb, clock) = breaker(CircuitBreakerConfig {
            interval_ms: 1000,
            ..config(3)
        });
        fail(&cb).unwrap_err();
        fail(&cb).unwrap_err();
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.counts(), Counts::default());

        fail(&cb).unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stale_generation_outcome_is_ignored() {
        let (cb, _) = breaker(config(1));
        let result = cb.execute(|| {
            // Another caller trips the breaker while this call is in flight
            fail(&cb).unwrap_err();
            Err::<(), _>("late failure")
        });
        assert_eq!(result, Err(BreakerError::Inner("late failure")));
        assert_eq!(cb.snapshot().generation, 1);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[test]
    fn test_panic_counts_as_failure() {
        let (cb, _) = breaker(config(1));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cb.execute(|| -> Result<(), ()> { panic!("operation panicked") })
        }));
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_and_snapshot() {
        let (cb, _) = breaker(config(1));
        fail(&cb).unwrap_err();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.name, "test");
        assert_eq!(snapshot.state, CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let json = serde_json::to_value(cb.snapshot()).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["counts"]["requests"], 0);
    }

    #[test]
    fn test_trip_is_counted_in_metrics() {
        let clock = MockClock::new(Instant::now());
        let metrics = Metrics::new();
        let cb = CircuitBreaker::new("m", config(1), Arc::new(clock), metrics.clone()).unwrap();
        fail(&cb).unwrap_err();
        assert_eq!(metrics.snapshot().breaker_trips, 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert_eq!(
            config(0).validate(),
            Err(BreakerConfigError::ZeroFailureThreshold)
        );
        assert_eq!(
            CircuitBreakerConfig {
                success_threshold: 0,
                ..config(1)
            }
            .validate(),
            Err(BreakerConfigError::ZeroSuccessThreshold)
        );
        assert_eq!(
            CircuitBreakerConfig {
                success_threshold: 4,
                ..Default::default()
            }
            .validate(),
            Err(BreakerConfigError::SuccessThresholdAboveMaxRequests {
                success_threshold: 4,
                max_requests: 3
            })
        );
        assert_eq!(
            CircuitBreakerConfig {
                failure_ratio: 1.5,
                ..Default::default()
            }
            .validate(),
            Err(BreakerConfigError::InvalidFailureRatio(1.5))
        );
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failure_threshold": 3, "timeout_ms": 500}"#).unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.max_requests, 3);
    }

    #[tokio::test]
    async fn test_execute_async() {
        let (cb, _) = breaker(config(1));
        let ok = cb.execute_async(|| async { Ok::<_, ()>(7) }).await;
        assert_eq!(ok, Ok(7));

        let err = cb.execute_async(|| async { Err::<(), _>("down") }).await;
        assert_eq!(err, Err(BreakerError::Inner("down")));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_failures() {
        let (cb, _) = breaker(CircuitBreakerConfig {
            failure_threshold: 1000,
            ..config(1)
        });
        let cb = Arc::new(cb);
        let mut handles = vec![];

        for _ in 0..10 {
            let cb = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _ = fail(&cb);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let counts = cb.counts();
        assert_eq!(counts.requests, 500);
        assert_eq!(counts.consecutive_failures, 500);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
