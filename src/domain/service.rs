//! Service instance records.
//!
//! A [`ServiceInfo`] describes one registered instance of a logical service.
//! Many instances share a `name`; each is identified by its caller-supplied `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Serving traffic
    #[default]
    Active,
    /// Registered but not serving
    Inactive,
    /// Finishing in-flight work before shutdown
    Draining,
    /// Taken out of rotation by an operator
    Maintenance,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Active => "active",
            ServiceStatus::Inactive => "inactive",
            ServiceStatus::Draining => "draining",
            ServiceStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// How an external health checker reaches the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
    Grpc,
    /// Liveness is inferred from heartbeats alone
    #[default]
    Ttl,
    None,
}

/// Last health check result reported for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Health-check descriptor embedded in every service record.
///
/// The registry stores this for the external probing engine; it never
/// executes the check itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub kind: CheckKind,
    /// Check target, e.g. `http://10.0.0.5:8080/health`
    pub endpoint: Option<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub status: HealthStatus,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            kind: CheckKind::Ttl,
            endpoint: None,
            interval_secs: 10,
            timeout_secs: 5,
            status: HealthStatus::Unknown,
        }
    }
}

impl HealthCheck {
    /// HTTP check against `endpoint`.
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self {
            kind: CheckKind::Http,
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// TCP connect check against `endpoint`.
    pub fn tcp(endpoint: impl Into<String>) -> Self {
        Self {
            kind: CheckKind::Tcp,
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }
}

/// Reason a service record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("service id must not be empty")]
    EmptyId,
    #[error("service name must not be empty")]
    EmptyName,
    #[error("service address must not be empty")]
    EmptyAddress,
    #[error("service port must be in 1..=65535")]
    InvalidPort,
}

/// One registered service instance.
///
/// `ttl` and `weight` use zero to mean "unset"; the registry fills in the
/// configured default TTL and a weight of 1. `registered_at` and `last_seen`
/// are likewise filled in on registration when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub health: HealthCheck,
    /// Heartbeat expiry window in seconds
    #[serde(default)]
    pub ttl: u64,
    /// Load-balancing hint
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ServiceInfo {
    /// Create a record with the required fields; everything else is unset.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            address: address.into(),
            port,
            tags: BTreeSet::new(),
            meta: BTreeMap::new(),
            health: HealthCheck::default(),
            ttl: 0,
            weight: 0,
            status: ServiceStatus::Active,
            registered_at: None,
            last_seen: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_health(mut self, health: HealthCheck) -> Self {
        self.health = health;
        self
    }

    /// Set the heartbeat expiry window in seconds.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = ttl_secs;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    /// Check the record's invariants.
    ///
    /// # Errors
    /// Returns the first violated invariant: empty `id`, `name` or `address`,
    /// or a zero `port`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.address.trim().is_empty() {
            return Err(ValidationError::EmptyAddress);
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }

    /// Fill in unset TTL and weight.
    pub(crate) fn apply_defaults(&mut self, default_ttl_secs: u64) {
        if self.ttl == 0 {
            self.ttl = default_ttl_secs;
        }
        if self.weight == 0 {
            self.weight = 1;
        }
    }

    /// The heartbeat expiry window.
    pub fn ttl_duration(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
