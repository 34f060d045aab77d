//! Rate limiters.
//!
//! A [`RateLimiter`] wraps one [`AdmissionAlgorithm`] behind its own lock and
//! adds the blocking `wait` path, non-consuming reservations and cumulative
//! counters. Limiters are built from a [`LimiterConfig`] by [`new_limiter`].

use crate::application::ports::Clock;
use crate::domain::algorithm::{
    AdmissionAlgorithm, Algorithm, AlgorithmState, FixedWindow, LeakyBucket, SlidingWindow,
    TokenBucket, UnknownAlgorithm,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shortest sleep between admission attempts in `wait_n`.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Horizon reported as `time_to_act` when a delay runs past what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Errors from limiter construction and waiting.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimiterError {
    #[error(transparent)]
    UnsupportedAlgorithm(#[from] UnknownAlgorithm),
    #[error("invalid rate limiter config: {0}")]
    InvalidConfig(String),
    #[error("requested {requested} units but limiter capacity is {capacity}")]
    ExceedsCapacity { requested: u64, capacity: u64 },
    #[error("wait cancelled")]
    Cancelled,
}

/// Rate limiter configuration.
///
/// `rate` means tokens per second for the token bucket, drain per second for
/// the leaky bucket, and units per window for both window algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub algorithm: Algorithm,
    pub rate: f64,
    /// Token bucket capacity
    pub burst: u64,
    /// Window length for the window algorithms
    pub window_ms: u64,
    /// Leaky bucket capacity
    pub capacity: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            rate: 100.0,
            burst: 200,
            window_ms: 1000,
            capacity: 100,
        }
    }
}

impl LimiterConfig {
    pub fn token_bucket(rate: f64, burst: u64) -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            rate,
            burst,
            ..Self::default()
        }
    }

    pub fn leaky_bucket(rate: f64, capacity: u64) -> Self {
        Self {
            algorithm: Algorithm::LeakyBucket,
            rate,
            capacity,
            ..Self::default()
        }
    }

    pub fn fixed_window(limit: u64, window: Duration) -> Self {
        Self {
            algorithm: Algorithm::FixedWindow,
            rate: limit as f64,
            window_ms: window_millis(window),
            ..Self::default()
        }
    }

    pub fn sliding_window(limit: u64, window: Duration) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            rate: limit as f64,
            window_ms: window_millis(window),
            ..Self::default()
        }
    }

    /// Default parameters for the algorithm with the given name.
    pub fn from_name(algorithm: &str) -> Result<Self, LimiterError> {
        Ok(Self {
            algorithm: algorithm.parse()?,
            ..Self::default()
        })
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Check the parameters the configured algorithm uses.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(LimiterError::InvalidConfig(format!(
                "rate must be positive, got {}",
                self.rate
            )));
        }
        match self.algorithm {
            Algorithm::TokenBucket if self.burst == 0 => Err(LimiterError::InvalidConfig(
                "token bucket burst must be at least 1".into(),
            )),
            Algorithm::LeakyBucket if self.capacity == 0 => Err(LimiterError::InvalidConfig(
                "leaky bucket capacity must be at least 1".into(),
            )),
            Algorithm::FixedWindow | Algorithm::SlidingWindow => {
                if self.window_ms == 0 {
                    Err(LimiterError::InvalidConfig(
                        "window must be non-zero".into(),
                    ))
                } else if self.rate < 1.0 {
                    Err(LimiterError::InvalidConfig(format!(
                        "window limit must be at least 1, got {}",
                        self.rate
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn window_limit(&self) -> u64 {
        self.rate.floor() as u64
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of a non-consuming reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Always true; reservations never refuse
    pub ok: bool,
    pub tokens: u64,
    /// How long until `tokens` would be admitted
    pub delay: Duration,
    pub time_to_act: Instant,
}

/// Observability snapshot of one limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    pub algorithm: Algorithm,
    pub config: LimiterConfig,
    pub state: AlgorithmState,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
}

impl LimiterStats {
    /// Fraction of requests rejected (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.rejected_requests as f64 / self.total_requests as f64
        }
    }
}

/// Admission control behind one interface, whatever the algorithm.
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Admit one unit if available. Never blocks.
    fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Admit `n` units if available. Never blocks.
    fn allow_n(&self, n: u64) -> bool;

    /// Block until one unit is admitted or `cancel` fires.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        self.wait_n(1, cancel).await
    }

    /// Block until `n` units are admitted or `cancel` fires.
    async fn wait_n(&self, n: u64, cancel: &CancellationToken) -> Result<(), LimiterError>;

    fn reserve(&self) -> Reservation {
        self.reserve_n(1)
    }

    /// Report when `n` units would be admitted without consuming anything.
    fn reserve_n(&self, n: u64) -> Reservation;

    fn stats(&self) -> LimiterStats;

    /// Restore the freshly-built state and zero the counters.
    fn reset(&self);
}

/// A [`RateLimiter`] over any [`AdmissionAlgorithm`].
#[derive(Debug)]
pub struct AlgorithmLimiter<A> {
    algorithm: Mutex<A>,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    total: AtomicU64,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl<A: AdmissionAlgorithm> AlgorithmLimiter<A> {
    pub fn new(algorithm: A, config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            algorithm: Mutex::new(algorithm),
            config,
            clock,
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, A> {
        self.algorithm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, admitted: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if admitted {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl<A: AdmissionAlgorithm> RateLimiter for AlgorithmLimiter<A> {
    fn allow_n(&self, n: u64) -> bool {
        let admitted = self.lock().try_admit(n, self.clock.now());
        self.record(admitted);
        admitted
    }

    async fn wait_n(&self, n: u64, cancel: &CancellationToken) -> Result<(), LimiterError> {
        let capacity = self.lock().capacity();
        if n > capacity {
            return Err(LimiterError::ExceedsCapacity {
                requested: n,
                capacity,
            });
        }

        loop {
            if cancel.is_cancelled() {
                self.record(false);
                return Err(LimiterError::Cancelled);
            }

            let delay = {
                let mut algorithm = self.lock();
                let now = self.clock.now();
                if algorithm.try_admit(n, now) {
                    drop(algorithm);
                    self.record(true);
                    return Ok(());
                }
                algorithm.delay_for(n, now)
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(algorithm = %self.config.algorithm, n, "rate limiter wait cancelled");
                    self.record(false);
                    return Err(LimiterError::Cancelled);
                }
                _ = tokio::time::sleep(delay.max(MIN_WAIT)) => {}
            }
        }
    }

    fn reserve_n(&self, n: u64) -> Reservation {
        let now = self.clock.now();
        let delay = self.lock().delay_for(n, now);
        let time_to_act = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Reservation {
            ok: true,
            tokens: n,
            delay,
            time_to_act,
        }
    }

    fn stats(&self) -> LimiterStats {
        let algorithm = self.lock();
        LimiterStats {
            algorithm: algorithm.algorithm(),
            config: self.config.clone(),
            state: algorithm.state(),
            total_requests: self.total.load(Ordering::Relaxed),
            allowed_requests: self.allowed.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.lock().reset(self.clock.now());
        self.total.store(0, Ordering::Relaxed);
        self.allowed.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

/// Build the limiter `config` describes.
pub fn new_limiter(
    config: &LimiterConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RateLimiter>, LimiterError> {
    config.validate()?;
    let now = clock.now();
    let config = config.clone();

    let limiter: Arc<dyn RateLimiter> = match config.algorithm {
        Algorithm::TokenBucket => {
            let bucket = TokenBucket::new(config.rate, config.burst, now);
            Arc::new(AlgorithmLimiter::new(bucket, config, clock))
        }
        Algorithm::LeakyBucket => {
            let bucket = LeakyBucket::new(config.rate, config.capacity, now);
            Arc::new(AlgorithmLimiter::new(bucket, config, clock))
        }
        Algorithm::FixedWindow => {
            let window = FixedWindow::new(config.window_limit(), config.window(), now);
            Arc::new(AlgorithmLimiter::new(window, config, clock))
        }
        Algorithm::SlidingWindow => {
            let window = SlidingWindow::new(config.window_limit(), config.window());
            Arc::new(AlgorithmLimiter::new(window, config, clock))
        }
    };
    Ok(limiter)
}
