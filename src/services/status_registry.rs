use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::warn;

use crate::models::{ComponentHealth, HealthState, HealthSummary};

pub const COMPONENT_COMMANDS: &str = "commands";
pub const COMPONENT_CRON: &str = "cron";
pub const COMPONENT_HEARTBEAT: &str = "heartbeat";
pub const COMPONENT_TELEMETRY: &str = "telemetry";

/// Shared last-known state of every bridge component.
///
/// Cloning is cheap; all clones see the same registry.
#[derive(Clone, Debug)]
pub struct StatusRegistry {
    inner: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    machine_id: String,
    started: Instant,
    degraded_after: u32,
}

impl StatusRegistry {
    pub fn new(machine_id: impl Into<String>, degraded_after: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            machine_id: machine_id.into(),
            started: Instant::now(),
            degraded_after: degraded_after.max(1),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub async fn register(&self, component: &str) {
        self.inner
            .write()
            .await
            .entry(component.to_string())
            .or_default();
    }

    pub async fn record_success(&self, component: &str) {
        let mut components = self.inner.write().await;
        let entry = components.entry(component.to_string()).or_default();
        entry.state = HealthState::Healthy;
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(Utc::now());
    }

    /// Count a failure; the component turns degraded once the streak reaches the threshold.
    pub async fn record_failure(&self, component: &str, error: impl ToString) {
        let mut components = self.inner.write().await;
        let entry = components.entry(component.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error.to_string());
        entry.last_error_at = Some(Utc::now());

        if entry.consecutive_failures >= self.degraded_after && entry.state != HealthState::Degraded {
            entry.state = HealthState::Degraded;
            warn!(
                component,
                failures = entry.consecutive_failures,
                "component degraded"
            );
        }
    }

    pub async fn set_detail(&self, component: &str, key: &str, value: impl Into<JsonValue>) {
        self.inner
            .write()
            .await
            .entry(component.to_string())
            .or_default()
            .details
            .insert(key.to_string(), value.into());
    }

    pub async fn component(&self, component: &str) -> Option<ComponentHealth> {
        self.inner.read().await.get(component).cloned()
    }

    pub async fn overall(&self) -> HealthState {
        let degraded = self
            .inner
            .read()
            .await
            .values()
            .any(|c| c.state == HealthState::Degraded);
        if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub async fn snapshot(&self) -> HealthSummary {
        let components = self.inner.read().await.clone();
        let status = if components.values().any(|c| c.state == HealthState::Degraded) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthSummary {
            status,
            machine_id: self.machine_id.clone(),
            bridge_version: crate::BRIDGE_VERSION.to_string(),
            uptime_secs: self.uptime_secs(),
            components,
            checked_at: Utc::now(),
        }
    }
}
