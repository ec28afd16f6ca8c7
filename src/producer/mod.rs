//! Producer (data-source adapter) contract.
//!
//! Adapters live outside this crate. The pipeline only needs to know which
//! entities a producer will publish and how healthy it claims to be; protocol
//! parsing, polling and backoff stay with the adapter.

use crate::registry::EntityDefinition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse producer health, reported by the adapter itself
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
        };
        f.write_str(name)
    }
}

/// Health snapshot polled from a producer. Never gates ingestion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
}

impl AdapterHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: String::new(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
        }
    }
}

/// A data source that publishes readings onto the bus.
///
/// # Lifecycle
/// 1. The pipeline calls `entities()` once and registers every definition
/// 2. The producer publishes `SensorReading`s for those entities at any time
/// 3. Operators poll `health()`; the result is informational only
pub trait Producer: Send + Sync {
    /// Unique producer identifier; must match `source` on its readings
    fn source(&self) -> &str;

    /// Every entity this producer will ever publish
    fn entities(&self) -> Vec<EntityDefinition>;

    fn health(&self) -> AdapterHealth {
        AdapterHealth::default()
    }
}
