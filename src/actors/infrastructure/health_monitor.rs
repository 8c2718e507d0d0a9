use kameo::Actor;
use kameo::message::{Context, Message};
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::reply::{Reply, ReplyError};
use serde::Serialize;
use std::sync::Arc;
use std::collections::HashMap;
use std::time::Duration;
use chrono::Utc;
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitState};
use crate::actors::core::{HealthStatus, ComponentHealth};

// ============================================================================
// Health Monitor Actor - Aggregates component health
// ============================================================================
//
// Responsibilities:
// - Track the last reported status of every component
// - Periodically sample the publisher's circuit breaker
// - Aggregate a process-wide status for /health/components
//
// ============================================================================

// ============================================================================
// Messages
// ============================================================================

pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

impl UpdateHealth {
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            component: component.into(),
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub struct GetSystemHealth;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    #[serde(flatten)]
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: chrono::DateTime<Utc>,
}

// Implement Reply for SystemHealth to use it as a message reply type
impl Reply for SystemHealth {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

// ============================================================================
// Health Monitor Actor
// ============================================================================

pub struct HealthMonitorActor {
    components: HashMap<String, ComponentHealth>,
    breaker: Option<CircuitBreaker>,
    metrics: Option<Arc<Metrics>>,
    sample_interval: Duration,
}

impl HealthMonitorActor {
    pub fn new() -> Self {
        Self {
            components: HashMap::new(),
            breaker: None,
            metrics: None,
            sample_interval: Duration::from_secs(10),
        }
    }

    /// Sample `breaker` every `sample_interval` and report it as a component.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker, sample_interval: Duration) -> Self {
        self.breaker = Some(breaker);
        self.sample_interval = sample_interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut has_degraded = false;
        let mut unhealthy_components = Vec::new();

        let mut names: Vec<&String> = self.components.keys().collect();
        names.sort();

        for name in names {
            match &self.components[name].status {
                HealthStatus::Unhealthy(msg) => {
                    unhealthy_components.push(format!("{}: {}", name, msg));
                }
                HealthStatus::Degraded(_) => {
                    has_degraded = true;
                }
                HealthStatus::Healthy => {}
            }
        }

        if !unhealthy_components.is_empty() {
            HealthStatus::Unhealthy(unhealthy_components.join(", "))
        } else if has_degraded {
            HealthStatus::Degraded("Some components degraded".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Default for HealthMonitorActor {
    fn default() -> Self {
        Self::new()
    }
}

fn breaker_health(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::HalfOpen => HealthStatus::Degraded("Circuit breaker half-open".to_string()),
        CircuitState::Open => HealthStatus::Unhealthy("Circuit breaker open".to_string()),
    }
}

impl Actor for HealthMonitorActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(
        state: Self::Args,
        actor_ref: ActorRef<Self>
    ) -> Result<Self, Self::Error> {
        tracing::info!("HealthMonitorActor started");

        if let Some(breaker) = state.breaker.clone() {
            let metrics = state.metrics.clone();
            let sample_interval = state.sample_interval;
            let actor_ref = actor_ref.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sample_interval);
                let mut last = breaker.state();
                loop {
                    interval.tick().await;

                    let current = breaker.state();
                    if let Some(metrics) = &metrics {
                        metrics.update_circuit_breaker_state(last.as_str(), current.as_str(), current.as_gauge());
                    }
                    last = current;

                    let update = UpdateHealth::new(format!("circuit_breaker:{}", breaker.name()), breaker_health(current))
                        .with_details(format!("consecutive failures: {}", breaker.failure_count()));
                    if actor_ref.tell(update).send().await.is_err() {
                        // Monitor stopped
                        break;
                    }
                }
            });
        }

        Ok(state)
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<UpdateHealth> for HealthMonitorActor {
    type Reply = ();

    async fn handle(&mut self, msg: UpdateHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let previous = self.components.get(&msg.component).map(|c| c.status.clone());
        if previous.as_ref() != Some(&msg.status) {
            tracing::info!(
                component = %msg.component,
                status = ?msg.status,
                "Component health changed"
            );
        }

        let mut health = ComponentHealth::new(msg.component.clone(), msg.status);
        health.details = msg.details;
        self.components.insert(msg.component, health);

        if let Some(metrics) = &self.metrics {
            metrics.health_status.set(self.compute_overall_status().as_gauge());
        }
    }
}

impl Message<GetSystemHealth> for HealthMonitorActor {
    type Reply = SystemHealth;

    async fn handle(&mut self, _msg: GetSystemHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let overall_status = self.compute_overall_status();

        SystemHealth {
            overall_status,
            components: self.components.clone(),
            check_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::CircuitBreakerConfig;

    #[tokio::test]
    async fn test_overall_status_aggregates_components() {
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new());

        monitor.tell(UpdateHealth::new("broker", HealthStatus::Healthy)).send().await.unwrap();
        let health = monitor.ask(GetSystemHealth).send().await.unwrap();
        assert!(health.overall_status.is_healthy());

        monitor
            .tell(UpdateHealth::new("consumer:orders", HealthStatus::Degraded("reconnecting".into())))
            .send()
            .await
            .unwrap();
        let health = monitor.ask(GetSystemHealth).send().await.unwrap();
        assert!(matches!(health.overall_status, HealthStatus::Degraded(_)));

        monitor
            .tell(UpdateHealth::new("outbox", HealthStatus::Unhealthy("store down".into())))
            .send()
            .await
            .unwrap();
        let health = monitor.ask(GetSystemHealth).send().await.unwrap();
        assert_eq!(
            health.overall_status,
            HealthStatus::Unhealthy("outbox: store down".to_string())
        );
        assert_eq!(health.components.len(), 3);
    }

    #[tokio::test]
    async fn test_samples_circuit_breaker() {
        let breaker = CircuitBreaker::new("publisher", CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        });
        let _ = breaker
            .call(async { Err::<(), _>("down") }, |_| true)
            .await;

        let monitor = HealthMonitorActor::spawn(
            HealthMonitorActor::new().with_circuit_breaker(breaker, Duration::from_millis(10)),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let health = monitor.ask(GetSystemHealth).send().await.unwrap();
        let component = &health.components["circuit_breaker:publisher"];
        assert!(component.status.is_unhealthy());
        assert!(component
            .details
            .as_deref()
            .is_some_and(|d| d.starts_with("consecutive failures:")));
    }
}
