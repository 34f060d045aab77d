//! Observability metrics for the registry and its admission control.
//!
//! A [`Metrics`] handle is passed to each component at construction. Clones
//! share counters, so one handle can be threaded through the registry and
//! both managers, while separate handles keep test instances isolated.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking registry and admission statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    services_registered: AtomicU64,
    services_updated: AtomicU64,
    services_deregistered: AtomicU64,
    /// Removed by the heartbeat checker rather than by a caller
    services_evicted: AtomicU64,
    heartbeats_received: AtomicU64,
    events_emitted: AtomicU64,
    /// Dropped because a watcher's buffer was full
    events_dropped: AtomicU64,
    requests_admitted: AtomicU64,
    requests_rate_limited: AtomicU64,
    requests_short_circuited: AtomicU64,
    breaker_trips: AtomicU64,
    limiters_created: AtomicU64,
    breakers_created: AtomicU64,
}

macro_rules! counters {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $record(&self) {
                self.inner.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    counters! {
        record_registered => services_registered,
        record_updated => services_updated,
        record_deregistered => services_deregistered,
        record_evicted => services_evicted,
        record_heartbeat => heartbeats_received,
        record_event_emitted => events_emitted,
        record_event_dropped => events_dropped,
        record_admitted => requests_admitted,
        record_rate_limited => requests_rate_limited,
        record_short_circuited => requests_short_circuited,
        record_breaker_trip => breaker_trips,
        record_limiter_created => limiters_created,
        record_breaker_created => breakers_created,
    }

    /// Get the number of watcher events dropped on full buffers.
    pub fn events_dropped(&self) -> u64 {
        self.inner.events_dropped.load(Ordering::Relaxed)
    }

    /// Get the number of services evicted by the heartbeat checker.
    pub fn services_evicted(&self) -> u64 {
        self.inner.services_evicted.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        MetricsSnapshot {
            services_registered: load(&inner.services_registered),
            services_updated: load(&inner.services_updated),
            services_deregistered: load(&inner.services_deregistered),
            services_evicted: load(&inner.services_evicted),
            heartbeats_received: load(&inner.heartbeats_received),
            events_emitted: load(&inner.events_emitted),
            events_dropped: load(&inner.events_dropped),
            requests_admitted: load(&inner.requests_admitted),
            requests_rate_limited: load(&inner.requests_rate_limited),
            requests_short_circuited: load(&inner.requests_short_circuited),
            breaker_trips: load(&inner.breaker_trips),
            limiters_created: load(&inner.limiters_created),
            breakers_created: load(&inner.breakers_created),
        }
    }

    /// Reset all metrics to zero.
    ///
    /// Useful for testing or when starting a new monitoring period.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.services_registered,
            &inner.services_updated,
            &inner.services_deregistered,
            &inner.services_evicted,
            &inner.heartbeats_received,
            &inner.events_emitted,
            &inner.events_dropped,
            &inner.requests_admitted,
            &inner.requests_rate_limited,
            &inner.requests_short_circuited,
            &inner.breaker_trips,
            &inner.limiters_created,
            &inner.breakers_created,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub services_registered: u64,
    pub services_updated: u64,
    pub services_deregistered: u64,
    pub services_evicted: u64,
    pub heartbeats_received: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub requests_admitted: u64,
    pub requests_rate_limited: u64,
    pub requests_short_circuited: u64,
    pub breaker_trips: u64,
    pub limiters_created: u64,
    pub breakers_created: u64,
}

impl MetricsSnapshot {
    /// Total admission decisions (admitted + rate limited + short circuited).
    pub fn total_requests(&self) -> u64 {
        self.requests_admitted
            .saturating_add(self.requests_rate_limited)
            .saturating_add(self.requests_short_circuited)
    }

    /// Fraction of admission decisions that were rejections (0.0 to 1.0).
    ///
    /// Returns 0.0 if no requests have been processed.
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (total - self.requests_admitted) as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_state() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_counters() {
        let metrics = Metrics::new();
        metrics.record_registered();
        metrics.record_registered();
        metrics.record_evicted();
        metrics.record_event_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.services_registered, 2);
        assert_eq!(snapshot.services_evicted, 1);
        assert_eq!(metrics.services_evicted(), 1);
        assert_eq!(metrics.events_dropped(), 1);
    }

    #[test]
    fn test_rejection_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().rejection_rate(), 0.0);

        metrics.record_admitted();
        metrics.record_rate_limited();
        assert!((metrics.snapshot().rejection_rate() - 0.5).abs() < f64::EPSILON);

        metrics.record_short_circuited();
        metrics.record_admitted();
        assert_eq!(metrics.snapshot().total_requests(), 4);
        assert!((metrics.snapshot().rejection_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        metrics.record_heartbeat();
        metrics.record_breaker_trip();
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_clones_share_counters_but_instances_are_isolated() {
        let shared = Metrics::new();
        let clone = shared.clone();
        let isolated = Metrics::new();

        clone.record_registered();
        assert_eq!(shared.snapshot().services_registered, 1);
        assert_eq!(isolated.snapshot().services_registered, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let metrics = Metrics::new();
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    m.record_admitted();
                    m.record_rate_limited();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_admitted, 1000);
        assert_eq!(snapshot.requests_rate_limited, 1000);
    }
}
