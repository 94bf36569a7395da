//! Health check types
//!
//! Per-component checks roll up into a [`HealthReport`], which backs both
//! liveness ("is the coordinator running") and readiness ("should new
//! requests be routed here") decisions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status for the coordinator or one of its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but degraded
    Degraded,
    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

/// Detailed health check result for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    pub message: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            metadata: None,
        }
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            component: component.into(),
            message: Some(message.into()),
            metadata: None,
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            component: component.into(),
            message: Some(message.into()),
            metadata: None,
        }
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

/// Aggregated health of a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all checks.
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn new(version: impl Into<String>, uptime_secs: u64, checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.worst(c.status));
        Self {
            status,
            version: version.into(),
            uptime_secs,
            checks,
        }
    }

    /// Ready to accept traffic. A degraded coordinator still serves
    /// requests (durable-tier outages fail open).
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }

    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::new(
            "0.4.0",
            12,
            vec![
                HealthCheck::healthy("admission"),
                HealthCheck::degraded("durable_tier", "backing off"),
            ],
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());
        assert_eq!(
            report.check("durable_tier").and_then(|c| c.message.as_deref()),
            Some("backing off")
        );
    }

    #[test]
    fn test_unhealthy_is_not_ready() {
        let report = HealthReport::new(
            "0.4.0",
            0,
            vec![HealthCheck::unhealthy("admission", "closed")],
        );
        assert!(!report.is_ready());
    }

    #[test]
    fn test_empty_report_is_healthy() {
        let report = HealthReport::new("0.4.0", 0, vec![]);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
