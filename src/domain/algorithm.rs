//! Admission algorithms for rate limiting.
//!
//! This module defines the core trait for admission algorithms and the four
//! built-in implementations. Algorithms are pure state machines driven by the
//! timestamps they are handed; locking, counters and sleeping live in
//! `application::limiter`.
//!
//! All refill and decay math uses the time elapsed since the previous call,
//! so an idle algorithm does no work.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Poll interval used by the sliding window when it has no timestamp to
/// compute a precise delay from.
pub const SLIDING_WINDOW_POLL: Duration = Duration::from_millis(10);

/// Seconds as a `Duration`, clamped to `Duration::MAX` when out of range.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Which admission algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
}

/// Error for an algorithm name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported rate limiter algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            "fixed_window" => Ok(Algorithm::FixedWindow),
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for Algorithm {
    type Error = UnknownAlgorithm;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Live internal state, reported through limiter stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmState {
    TokenBucket { tokens: f64 },
    LeakyBucket { volume: f64 },
    FixedWindow { counter: u64 },
    SlidingWindow { in_window: usize },
}

/// Trait for implementing admission algorithms.
///
/// Every method receives the current time so implementations never read a
/// clock themselves.
pub trait AdmissionAlgorithm: Send + Sync + fmt::Debug {
    /// Admit `n` units if available, consuming them.
    fn try_admit(&mut self, n: u64, now: Instant) -> bool;

    /// How long until `n` units would be admitted. Does not consume.
    fn delay_for(&mut self, n: u64, now: Instant) -> Duration;

    /// Return to the freshly-constructed state.
    fn reset(&mut self, now: Instant);

    /// Largest `n` that can ever be admitted in one call.
    fn capacity(&self) -> u64;

    fn algorithm(&self) -> Algorithm;

    fn state(&self) -> AlgorithmState;
}

/// Token bucket.
///
/// Starts full with `burst` tokens and refills at `rate` tokens per second.
///
/// # Example
/// ```
/// use registry_shield::domain::algorithm::{AdmissionAlgorithm, TokenBucket};
/// use std::time::{Duration, Instant};
///
/// let now = Instant::now();
/// let mut bucket = TokenBucket::new(1.0, 2, now);
///
/// assert!(bucket.try_admit(1, now));
/// assert!(bucket.try_admit(1, now));
/// assert!(!bucket.try_admit(1, now));
///
/// // One token per second
/// assert!(bucket.try_admit(1, now + Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u64, now: Instant) -> Self {
        Self {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now > self.last {
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
            self.last = now;
        }
    }
}

impl AdmissionAlgorithm for TokenBucket {
    fn try_admit(&mut self, n: u64, now: Instant) -> bool {
        self.refill(now);
        let needed = n as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    fn delay_for(&mut self, n: u64, now: Instant) -> Duration {
        self.refill(now);
        let shortfall = n as f64 - self.tokens;
        if shortfall <= 0.0 {
            Duration::ZERO
        } else {
            saturating_secs(shortfall / self.rate)
        }
    }

    fn reset(&mut self, now: Instant) {
        self.tokens = self.burst;
        self.last = now;
    }

    fn capacity(&self) -> u64 {
        self.burst as u64
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn state(&self) -> AlgorithmState {
        AlgorithmState::TokenBucket {
            tokens: self.tokens,
        }
    }
}

/// Leaky bucket.
///
/// Each admission pours `n` units of water in; the bucket drains at `rate`
/// units per second and rejects anything that would overflow `capacity`.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    rate: f64,
    capacity: f64,
    volume: f64,
    last: Instant,
}

impl LeakyBucket {
    pub fn new(rate: f64, capacity: u64, now: Instant) -> Self {
        Self {
            rate,
            capacity: capacity as f64,
            volume: 0.0,
            last: now,
        }
    }

    fn leak(&mut self, now: Instant) {
        if now > self.last {
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.volume = (self.volume - elapsed * self.rate).max(0.0);
            self.last = now;
        }
    }
}

impl AdmissionAlgorithm for LeakyBucket {
    fn try_admit(&mut self, n: u64, now: Instant) -> bool {
        self.leak(now);
        let incoming = n as f64;
        if self.volume + incoming <= self.capacity {
            self.volume += incoming;
            true
        } else {
            false
        }
    }

    fn delay_for(&mut self, n: u64, now: Instant) -> Duration {
        self.leak(now);
        let overflow = self.volume + n as f64 - self.capacity;
        if overflow <= 0.0 {
            Duration::ZERO
        } else {
            saturating_secs(overflow / self.rate)
        }
    }

    fn reset(&mut self, now: Instant) {
        self.volume = 0.0;
        self.last = now;
    }

    fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn state(&self) -> AlgorithmState {
        AlgorithmState::LeakyBucket {
            volume: self.volume,
        }
    }
}

/// Fixed window counter.
///
/// Allows `limit` units per window; the counter resets once a full window
/// has elapsed since the window started.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
    counter: u64,
    window_start: Instant,
}

impl FixedWindow {
    pub fn new(limit: u64, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            counter: 0,
            window_start: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.counter = 0;
            self.window_start = now;
        }
    }
}

impl AdmissionAlgorithm for FixedWindow {
    fn try_admit(&mut self, n: u64, now: Instant) -> bool {
        self.roll(now);
        if self.counter.saturating_add(n) <= self.limit {
            self.counter += n;
            true
        } else {
            false
        }
    }

    fn delay_for(&mut self, n: u64, now: Instant) -> Duration {
        self.roll(now);
        if self.counter.saturating_add(n) <= self.limit {
            Duration::ZERO
        } else {
            let elapsed = now.saturating_duration_since(self.window_start);
            self.window.saturating_sub(elapsed)
        }
    }

    fn reset(&mut self, now: Instant) {
        self.counter = 0;
        self.window_start = now;
    }

    fn capacity(&self) -> u64 {
        self.limit
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn state(&self) -> AlgorithmState {
        AlgorithmState::FixedWindow {
            counter: self.counter,
        }
    }
}

/// Sliding window log.
///
/// Keeps one timestamp per admitted unit and allows `limit` units within any
/// trailing `window`.
///
/// # Example
/// ```
/// use registry_shield::domain::algorithm::{AdmissionAlgorithm, SlidingWindow};
/// use std::time::{Duration, Instant};
///
/// let now = Instant::now();
/// let mut window = SlidingWindow::new(2, Duration::from_secs(1));
///
/// assert!(window.try_admit(1, now));
/// assert!(window.try_admit(1, now));
/// assert!(!window.try_admit(1, now));
///
/// assert!(window.try_admit(1, now + Duration::from_millis(1010)));
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: u64,
    window: Duration,
    log: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            log: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.log.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.log.pop_front();
            } else {
                break;
            }
        }
    }

    fn fits(&self, n: u64) -> bool {
        (self.log.len() as u64).saturating_add(n) <= self.limit
    }
}

impl AdmissionAlgorithm for SlidingWindow {
    fn try_admit(&mut self, n: u64, now: Instant) -> bool {
        self.prune(now);
        if self.fits(n) {
            self.log.extend(std::iter::repeat(now).take(n as usize));
            true
        } else {
            false
        }
    }

    fn delay_for(&mut self, n: u64, now: Instant) -> Duration {
        self.prune(now);
        if self.fits(n) {
            return Duration::ZERO;
        }

        // The entry whose expiry frees enough room for `n`
        let excess = ((self.log.len() as u64).saturating_add(n) - self.limit) as usize;
        match self.log.get(excess.saturating_sub(1)) {
            Some(&ts) => match ts.checked_add(self.window) {
                Some(expiry) => expiry.saturating_duration_since(now),
                None => Duration::MAX,
            },
            None => SLIDING_WINDOW_POLL,
        }
    }

    fn reset(&mut self, _now: Instant) {
        self.log.clear();
    }

    fn capacity(&self) -> u64 {
        self.limit
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn state(&self) -> AlgorithmState {
        AlgorithmState::SlidingWindow {
            in_window: self.log.len(),
        }
    }
}
