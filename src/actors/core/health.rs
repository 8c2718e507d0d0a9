use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Health Check Abstractions
// ============================================================================
//
// Components (broker connection, publisher, consumers, relay) report their
// status to the HealthMonitorActor using these types. Serialized as
// {"status": "degraded", "reason": "..."} for /health/components.
//
// ============================================================================

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }

    /// Gauge encoding (0=Unhealthy, 1=Degraded, 2=Healthy)
    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthStatus::Unhealthy(_) => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Healthy => 2,
        }
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    #[serde(flatten)]
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_with_reason() {
        let mut health = ComponentHealth::new("consumer:orders", HealthStatus::Degraded("reconnecting".into()));
        health.details = Some("attempt 2".into());
        let json = serde_json::to_value(&health).unwrap();

        assert_eq!(json["name"], "consumer:orders");
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["reason"], "reconnecting");
        assert_eq!(json["details"], "attempt 2");
    }

    #[test]
    fn test_healthy_has_no_reason() {
        let json = serde_json::to_value(ComponentHealth::new("broker", HealthStatus::Healthy)).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json.get("reason").is_none());
    }
}
