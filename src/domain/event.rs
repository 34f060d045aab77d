//! Service-change notifications delivered to watchers.

use crate::domain::service::ServiceInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEventKind {
    Register,
    Deregister,
    Update,
    Healthy,
    Unhealthy,
}

impl fmt::Display for ServiceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceEventKind::Register => "register",
            ServiceEventKind::Deregister => "deregister",
            ServiceEventKind::Update => "update",
            ServiceEventKind::Healthy => "healthy",
            ServiceEventKind::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Immutable notification carrying a snapshot of the record at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub service: ServiceInfo,
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(kind: ServiceEventKind, service: ServiceInfo, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            service,
            timestamp,
        }
    }

    /// Id of the instance the event is about.
    pub fn service_id(&self) -> &str {
        &self.service.id
    }
}
