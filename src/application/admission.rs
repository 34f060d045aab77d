//! Admission control in front of registry mutations.
//!
//! Every mutation passes three stages in order: the operation's rate limiter,
//! the circuit breaker for the operation and its target, then the registry
//! call itself. The outcome is logged and counted afterwards.
//!
//! Only systemic registry errors count against a breaker. Validation and
//! not-found errors are the caller's fault and leave breakers closed.
//!
//! Breakers are keyed per instance, so the controller also drops them once
//! they describe nothing: after a deregistration, after a client fault on an
//! idle breaker, and on every prune pass for instances the registry no
//! longer holds.

use crate::application::breaker_manager::CircuitBreakerManager;
use crate::application::circuit_breaker::{BreakerConfigError, BreakerError, CircuitBreakerConfig};
use crate::application::heartbeat::{spawn_checker, CheckerHandle};
use crate::application::limiter::{LimiterConfig, LimiterError};
use crate::application::limiter_manager::RateLimiterManager;
use crate::application::metrics::Metrics;
use crate::application::ports::Clock;
use crate::application::registry::{RegistryConfig, RegistryError, ServiceRegistry};
use crate::domain::service::{HealthStatus, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A guarded registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Registration,
    Deregistration,
    Heartbeat,
    Health,
}

impl Operation {
    /// Key of the shared limiter for this operation.
    pub fn limiter_key(&self) -> &'static str {
        match self {
            Operation::Registration => "service_registration",
            Operation::Deregistration => "service_deregistration",
            Operation::Heartbeat => "service_heartbeat",
            Operation::Health => "service_health",
        }
    }

    /// Key of the breaker for this operation on `target`.
    ///
    /// Registration is keyed by service name, everything else by instance id.
    pub fn breaker_key(&self, target: &str) -> String {
        let prefix = match self {
            Operation::Registration => "registration",
            Operation::Deregistration => "deregistration",
            Operation::Heartbeat => "heartbeat",
            Operation::Health => "health",
        };
        format!("{}:{}", prefix, target)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.limiter_key())
    }
}

/// Limiter configs, one per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationLimits {
    pub registration: LimiterConfig,
    pub deregistration: LimiterConfig,
    pub heartbeat: LimiterConfig,
    pub health: LimiterConfig,
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            registration: LimiterConfig::token_bucket(100.0, 200),
            deregistration: LimiterConfig::token_bucket(100.0, 200),
            heartbeat: LimiterConfig::token_bucket(1000.0, 2000),
            health: LimiterConfig::token_bucket(1000.0, 2000),
        }
    }
}

impl OperationLimits {
    pub fn for_operation(&self, operation: Operation) -> &LimiterConfig {
        match operation {
            Operation::Registration => &self.registration,
            Operation::Deregistration => &self.deregistration,
            Operation::Heartbeat => &self.heartbeat,
            Operation::Health => &self.health,
        }
    }
}

/// Everything needed to build an [`AdmissionController`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub registry: RegistryConfig,
    pub limits: OperationLimits,
    pub breaker: CircuitBreakerConfig,
}

/// Invalid [`ShieldConfig`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{operation} limiter: {source}")]
    Limiter {
        operation: Operation,
        source: LimiterError,
    },
    #[error("circuit breaker: {0}")]
    Breaker(#[from] BreakerConfigError),
}

impl ShieldConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        for operation in [
            Operation::Registration,
            Operation::Deregistration,
            Operation::Heartbeat,
            Operation::Health,
        ] {
            self.limits
                .for_operation(operation)
                .validate()
                .map_err(|source| ConfigError::Limiter { operation, source })?;
        }
        self.breaker.validate()?;
        Ok(())
    }
}

/// Why a guarded mutation did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded for {operation}")]
    RateLimited { operation: Operation },
    #[error("circuit breaker {key} is open")]
    CircuitOpen { key: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

impl AdmissionError {
    /// HTTP-equivalent status for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::RateLimited { .. } => 429,
            AdmissionError::CircuitOpen { .. } => 503,
            AdmissionError::Registry(RegistryError::Validation(_)) => 400,
            AdmissionError::Registry(RegistryError::NotFound(_)) => 404,
            AdmissionError::Registry(_) | AdmissionError::Limiter(_) => 500,
        }
    }

    /// Rejections by the limiter or breaker are worth retrying later;
    /// registry errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::RateLimited { .. } | AdmissionError::CircuitOpen { .. }
        )
    }
}

/// Rate limiting and circuit breaking around a [`ServiceRegistry`].
#[derive(Debug)]
pub struct AdmissionController {
    registry: ServiceRegistry,
    limiters: RateLimiterManager,
    breakers: Arc<CircuitBreakerManager>,
    limits: OperationLimits,
    metrics: Metrics,
    pruner: Mutex<Option<CheckerHandle>>,
}

impl AdmissionController {
    /// Build the registry and both managers from one config.
    ///
    /// All components share `metrics`.
    pub fn new(
        config: ShieldConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ServiceRegistry::new(config.registry, Arc::clone(&clock), metrics.clone())?;
        let limiters = RateLimiterManager::new(Arc::clone(&clock), metrics.clone());
        let breakers = CircuitBreakerManager::new(config.breaker, clock, metrics.clone())?;
        Ok(Self {
            registry,
            limiters,
            breakers: Arc::new(breakers),
            limits: config.limits,
            metrics,
            pruner: Mutex::new(None),
        })
    }

    /// Start the registry's heartbeat checker and a task that prunes
    /// breakers of departed instances on the same interval.
    pub fn start(&self) -> Result<(), RegistryError> {
        let mut pruner = self.pruner();
        if pruner.is_some() {
            return Err(RegistryError::AlreadyStarted);
        }
        self.registry.start()?;

        let registry = self.registry.clone();
        let breakers = Arc::downgrade(&self.breakers);
        *pruner = Some(spawn_checker(
            self.registry.config().heartbeat_interval(),
            CancellationToken::new(),
            move || match breakers.upgrade() {
                Some(breakers) => {
                    prune(&registry, &breakers);
                    true
                }
                None => false,
            },
        ));
        Ok(())
    }

    /// Stop the pruning task and the registry. A no-op when not started.
    pub async fn stop(&self) {
        let handle = self.pruner().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.shutdown().await {
                warn!(error = %err, "breaker pruner did not stop cleanly");
            }
        }
        self.registry.stop().await;
    }

    /// Drop breakers for instances and service names the registry no
    /// longer holds. Returns the number dropped.
    pub fn prune_breakers(&self) -> usize {
        prune(&self.registry, &self.breakers)
    }

    fn pruner(&self) -> MutexGuard<'_, Option<CheckerHandle>> {
        self.pruner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn limiters(&self) -> &RateLimiterManager {
        &self.limiters
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn register(&self, service: ServiceInfo) -> Result<(), AdmissionError> {
        let name = service.name.clone();
        self.admit(Operation::Registration, &name, |registry| {
            registry.register(service)
        })
    }

    /// Deregister `id` and drop every breaker keyed on it.
    pub fn deregister(&self, id: &str) -> Result<(), AdmissionError> {
        self.admit(Operation::Deregistration, id, |registry| registry.deregister(id))?;
        for operation in [Operation::Deregistration, Operation::Heartbeat, Operation::Health] {
            self.breakers.remove(&operation.breaker_key(id));
        }
        Ok(())
    }

    pub fn heartbeat(&self, id: &str) -> Result<(), AdmissionError> {
        self.admit(Operation::Heartbeat, id, |registry| registry.heartbeat(id))
    }

    pub fn update_health(&self, id: &str, status: HealthStatus) -> Result<(), AdmissionError> {
        self.admit(Operation::Health, id, |registry| {
            registry.update_health(id, status)
        })
    }

    fn admit<T, F>(&self, operation: Operation, target: &str, call: F) -> Result<T, AdmissionError>
    where
        F: FnOnce(&ServiceRegistry) -> Result<T, RegistryError>,
    {
        let limiter = self
            .limiters
            .get_limiter(operation.limiter_key(), self.limits.for_operation(operation))?;
        if !limiter.allow() {
            self.metrics.record_rate_limited();
            debug!(%operation, service = target, "rate limit exceeded");
            return Err(AdmissionError::RateLimited { operation });
        }

        let key = operation.breaker_key(target);
        let breaker = self.breakers.get(&key);
        let outcome = breaker.execute_with(|| call(&self.registry), |err| !err.is_client_fault());
        match outcome {
            Ok(value) => {
                self.metrics.record_admitted();
                debug!(%operation, service = target, "operation admitted");
                Ok(value)
            }
            Err(BreakerError::Inner(err)) => {
                self.metrics.record_admitted();
                if err.is_client_fault() {
                    self.breakers.remove_idle(&key);
                }
                info!(%operation, service = target, error = %err, "registry operation failed");
                Err(err.into())
            }
            Err(rejection) => {
                self.metrics.record_short_circuited();
                warn!(
                    %operation,
                    service = target,
                    breaker = %key,
                    reason = %rejection,
                    "operation rejected by circuit breaker"
                );
                Err(AdmissionError::CircuitOpen { key })
            }
        }
    }
}

/// Keep id-keyed breakers for registered ids, and registration breakers for
/// names with instances or with failures still on record.
fn prune(registry: &ServiceRegistry, breakers: &CircuitBreakerManager) -> usize {
    let (ids, names) = registry.live_keys();
    breakers.retain(|key, breaker| match key.split_once(':') {
        Some(("registration", name)) => names.contains(name) || !breaker.is_idle(),
        Some((_, id)) => ids.contains(id),
        None => true,
    })
}
