use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Health Check Abstractions
// ============================================================================
//
// Services, the relay and the bus report health through one trait so the
// /health endpoint can aggregate them without knowing their types.
//
// ============================================================================

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded(_))
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last_check: Utc::now(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Components that can report their health status
pub trait HealthCheckable: Send + Sync {
    /// Get the current health status
    fn check_health(&self) -> ComponentHealth;

    /// Get the component name
    fn component_name(&self) -> &str;
}

/// Worst status across a set of components; healthy when empty
pub fn overall_status(components: &[ComponentHealth]) -> HealthStatus {
    let unhealthy: Vec<&str> = components
        .iter()
        .filter(|c| c.status.is_unhealthy())
        .map(|c| c.name.as_str())
        .collect();
    if !unhealthy.is_empty() {
        return HealthStatus::Unhealthy(format!("unhealthy: {}", unhealthy.join(", ")));
    }

    let degraded: Vec<&str> = components
        .iter()
        .filter(|c| c.status.is_degraded())
        .map(|c| c.name.as_str())
        .collect();
    if !degraded.is_empty() {
        return HealthStatus::Degraded(format!("degraded: {}", degraded.join(", ")));
    }

    HealthStatus::Healthy
}
