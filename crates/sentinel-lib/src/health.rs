//! Pipeline health tracking
//!
//! The detection loop reports every stage outcome here. A stage that fails
//! is degraded until it succeeds again; one that keeps failing for
//! [`UNHEALTHY_AFTER_FAILURES`] consecutive cycles is unhealthy, which takes
//! the sentinel out of readiness.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failures after which a component is reported unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 5;

/// Pipeline components with their own health entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Capture,
    Extractor,
    Predictor,
    Emitter,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Capture,
        Component::Extractor,
        Component::Predictor,
        Component::Emitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Capture => "capture",
            Component::Extractor => "extractor",
            Component::Predictor => "predictor",
            Component::Emitter => "emitter",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// The last attempt failed; the next cycle retries
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub consecutive_failures: u32,
    /// Unix timestamp of the last report
    pub updated_at: i64,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    fn fail(&mut self, message: String) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.status = if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        self.message = Some(message);
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// Snapshot served on the liveness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub running: bool,
    pub cycles_emitted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_emit_at: Option<i64>,
    pub components: BTreeMap<Component, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct PipelineHealth {
    components: BTreeMap<Component, ComponentHealth>,
    running: bool,
    cycles_emitted: u64,
    last_emit_at: Option<i64>,
}

impl PipelineHealth {
    fn entry(&mut self, component: Component) -> &mut ComponentHealth {
        self.components
            .entry(component)
            .or_insert_with(ComponentHealth::healthy)
    }

    fn worst(&self) -> ComponentStatus {
        self.components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Shared, cloneable view of the pipeline's health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<PipelineHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every component to healthy
    pub async fn register_pipeline(&self) {
        let mut inner = self.inner.write().await;
        for component in Component::ALL {
            inner.components.insert(component, ComponentHealth::healthy());
        }
    }

    pub async fn record_success(&self, component: Component) {
        let mut inner = self.inner.write().await;
        *inner.entry(component) = ComponentHealth::healthy();
    }

    /// Record a recoverable failure; returns the resulting status
    pub async fn record_failure(
        &self,
        component: Component,
        message: impl Into<String>,
    ) -> ComponentStatus {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(component);
        entry.fail(message.into());
        entry.status
    }

    /// Note that a cycle emitted its record
    pub async fn record_emit(&self) {
        let mut inner = self.inner.write().await;
        inner.cycles_emitted += 1;
        inner.last_emit_at = Some(chrono::Utc::now().timestamp());
    }

    pub async fn set_running(&self, running: bool) {
        self.inner.write().await.running = running;
    }

    pub async fn report(&self) -> HealthReport {
        let inner = self.inner.read().await;
        HealthReport {
            status: inner.worst(),
            running: inner.running,
            cycles_emitted: inner.cycles_emitted,
            last_emit_at: inner.last_emit_at,
            components: inner.components.clone(),
        }
    }

    /// Ready while the loop runs and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessReport {
        let inner = self.inner.read().await;

        let reason = if !inner.running {
            Some("detection loop not running".to_string())
        } else {
            inner
                .components
                .iter()
                .find(|(_, health)| !health.status.is_operational())
                .map(|(component, _)| format!("{} is unhealthy", component))
        };

        ReadinessReport {
            ready: reason.is_none(),
            reason,
        }
    }
}
