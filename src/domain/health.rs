//! Aggregate registry health.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Overall registry verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryStatus {
    /// No unhealthy instances
    Healthy,
    /// Some instances unhealthy, some healthy
    Degraded,
    /// No healthy instances
    Unhealthy,
}

impl fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistryStatus::Healthy => "healthy",
            RegistryStatus::Degraded => "degraded",
            RegistryStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Health summary computed on demand from the live registry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryHealth {
    pub status: RegistryStatus,
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub details: BTreeMap<String, String>,
}

impl RegistryHealth {
    /// Derive the status from instance counts.
    ///
    /// An empty registry has no unhealthy instances and is therefore healthy.
    pub fn from_counts(total: usize, healthy: usize) -> Self {
        let healthy = healthy.min(total);
        let unhealthy = total - healthy;
        let status = if unhealthy == 0 {
            RegistryStatus::Healthy
        } else if healthy == 0 {
            RegistryStatus::Unhealthy
        } else {
            RegistryStatus::Degraded
        };

        Self {
            status,
            total_services: total,
            healthy_services: healthy,
            unhealthy_services: unhealthy,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(RegistryHealth::from_counts(0, 0).status, RegistryStatus::Healthy);
        assert_eq!(RegistryHealth::from_counts(3, 3).status, RegistryStatus::Healthy);
        assert_eq!(RegistryHealth::from_counts(3, 1).status, RegistryStatus::Degraded);
        assert_eq!(RegistryHealth::from_counts(3, 0).status, RegistryStatus::Unhealthy);
    }

    #[test]
    fn test_counts_are_consistent() {
        let health = RegistryHealth::from_counts(5, 2);
        assert_eq!(health.total_services, 5);
        assert_eq!(health.healthy_services, 2);
        assert_eq!(health.unhealthy_services, 3);
    }
}
