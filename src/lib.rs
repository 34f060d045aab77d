//! # registry-shield
//!
//! The liveness and admission-control core of a service registry.
//!
//! This crate tracks which service instances exist and whether they are
//! alive, and protects the registry's own mutations from overload and
//! cascading failure with rate limiters and circuit breakers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use registry_shield::{
//!     AdmissionController, Metrics, ServiceInfo, ShieldConfig, SystemClock,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = AdmissionController::new(
//!     ShieldConfig::default(),
//!     Arc::new(SystemClock::new()),
//!     Metrics::new(),
//! )?;
//! controller.registry().start()?;
//!
//! let mut events = controller
//!     .registry()
//!     .watch("payments", CancellationToken::new())?;
//!
//! controller.register(ServiceInfo::new("payments-1", "payments", "10.0.0.7", 8443))?;
//! controller.heartbeat("payments-1")?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.kind, event.service_id());
//! }
//!
//! controller.registry().stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! ### Service registry
//! [`ServiceRegistry`] holds service records, heartbeat timestamps and
//! watcher channels behind one `RwLock`. A background heartbeat checker
//! evicts every instance whose last heartbeat is older than its TTL and
//! notifies watchers exactly as an explicit deregistration would.
//!
//! Watchers get bounded channels. When a watcher's buffer is full the event
//! is dropped for that watcher and a warning is logged, so a slow consumer
//! never stalls registry mutations.
//!
//! ### Rate limiters
//! Four algorithms share the [`RateLimiter`] trait:
//! - **Token bucket**: burst tolerance with steady refill
//! - **Leaky bucket**: smooths input to a constant drain rate
//! - **Fixed window**: N per window, reset at rollover
//! - **Sliding window**: N within any trailing window
//!
//! All refill math is driven by elapsed time since the previous call, so an
//! idle limiter costs nothing. [`RateLimiterManager`] creates one limiter
//! per key on first use.
//!
//! ### Circuit breakers
//! [`CircuitBreaker`] moves between closed, open and half-open on
//! consecutive failures, a failure ratio, and a recovery timeout.
//! [`CircuitBreakerManager`] keys breakers per operation and target, so one
//! failing service cannot open the breaker of another.
//!
//! ### Admission
//! [`AdmissionController`] runs every mutation through its limiter, then its
//! breaker, then the registry. Only systemic registry errors count against a
//! breaker; bad requests and unknown ids do not. Rejections map to distinct
//! [`AdmissionError`] variants with HTTP-equivalent status codes:
//!
//! | Outcome | Variant | Status |
//! |---------|---------|--------|
//! | Rate limit exceeded | `RateLimited` | 429 |
//! | Breaker open | `CircuitOpen` | 503 |
//! | Invalid record | `Registry(Validation)` | 400 |
//! | Unknown id | `Registry(NotFound)` | 404 |
//!
//! ## Observability
//!
//! Every component takes a [`Metrics`] handle at construction. There are no
//! global counters, so isolated instances can run side by side in tests.
//!
//! ```rust,no_run
//! # use registry_shield::{AdmissionController, Metrics, ShieldConfig, SystemClock};
//! # use std::sync::Arc;
//! # let metrics = Metrics::new();
//! # let controller = AdmissionController::new(ShieldConfig::default(), Arc::new(SystemClock::new()), metrics.clone()).unwrap();
//! let snapshot = metrics.snapshot();
//! println!("evicted: {}", snapshot.services_evicted);
//! println!("rejection rate: {:.2}%", snapshot.rejection_rate() * 100.0);
//! ```
//!
//! Logging goes through `tracing`; the crate never installs a subscriber.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    algorithm::{AdmissionAlgorithm, Algorithm, AlgorithmState, UnknownAlgorithm},
    event::{ServiceEvent, ServiceEventKind},
    health::{RegistryHealth, RegistryStatus},
    service::{CheckKind, HealthCheck, HealthStatus, ServiceInfo, ServiceStatus, ValidationError},
};

pub use application::{
    admission::{
        AdmissionController, AdmissionError, ConfigError, Operation, OperationLimits,
        ShieldConfig,
    },
    breaker_manager::CircuitBreakerManager,
    circuit_breaker::{
        BreakerConfigError, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
        CircuitState, Counts,
    },
    heartbeat::ShutdownError,
    limiter::{new_limiter, LimiterConfig, LimiterError, LimiterStats, RateLimiter, Reservation},
    limiter_manager::RateLimiterManager,
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, Storage},
    registry::{RegistryConfig, RegistryError, ServiceRegistry},
};

pub use infrastructure::{clock::SystemClock, storage::ShardedStorage};
