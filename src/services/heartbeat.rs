use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::{MachineHeartbeat, TelemetryEnvelope, TelemetryEvent};
use crate::services::command_lease::InFlightCommands;
use crate::services::control_plane::ControlPlane;
use crate::services::status_registry::{COMPONENT_HEARTBEAT, StatusRegistry};
use crate::services::telemetry_spooler::TelemetrySpooler;
use crate::storage::MachineIdentity;

/// Periodic machine-status heartbeat.
///
/// Sent directly; a failed heartbeat goes to the spool when spooling is on and
/// is otherwise superseded by the next one.
pub struct HeartbeatEmitter {
    identity: MachineIdentity,
    control: Arc<dyn ControlPlane>,
    spooler: Arc<TelemetrySpooler>,
    registry: StatusRegistry,
    in_flight: InFlightCommands,
    heartbeat_interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(
        identity: MachineIdentity,
        control: Arc<dyn ControlPlane>,
        spooler: Arc<TelemetrySpooler>,
        registry: StatusRegistry,
        in_flight: InFlightCommands,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            identity,
            control,
            spooler,
            registry,
            in_flight,
            heartbeat_interval,
        }
    }

    pub async fn snapshot(&self) -> MachineHeartbeat {
        MachineHeartbeat {
            machine_id: self.identity.machine_id.clone(),
            machine_label: self.identity.label.clone(),
            bridge_version: crate::BRIDGE_VERSION.to_string(),
            status: self.registry.overall().await,
            uptime_secs: self.registry.uptime_secs(),
            in_flight_commands: self.in_flight.len().await,
            spool_depth: self.spooler.depth().await,
            dropped_events: self.spooler.dropped().await,
            sent_at: Utc::now(),
        }
    }

    pub async fn beat_once(&self) -> AppResult<()> {
        let heartbeat = self.snapshot().await;
        let envelope = TelemetryEnvelope::direct(
            &self.identity.machine_id,
            TelemetryEvent::Heartbeat(heartbeat.clone()),
        );

        match self.control.send_telemetry(&envelope).await {
            Ok(()) => {
                debug!(status = ?heartbeat.status, in_flight = heartbeat.in_flight_commands, "heartbeat sent");
                self.registry.record_success(COMPONENT_HEARTBEAT).await;
                self.registry
                    .set_detail(COMPONENT_HEARTBEAT, "lastSentAt", heartbeat.sent_at.to_rfc3339())
                    .await;
                Ok(())
            }
            Err(e) => {
                self.registry.record_failure(COMPONENT_HEARTBEAT, &e).await;
                if self.spooler.is_spooling() {
                    debug!(error = %e, "heartbeat failed, queued for retry");
                    self.spooler.append(TelemetryEvent::Heartbeat(heartbeat)).await?;
                } else {
                    debug!(error = %e, "heartbeat failed, next one supersedes it");
                }
                Err(e)
            }
        }
    }

    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            heartbeat_interval_ms = self.heartbeat_interval.as_millis() as u64,
            "heartbeat emitter starting"
        );
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("heartbeat emitter stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.beat_once().await {
                        warn!(error = %e, "heartbeat not delivered");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::FakeControlPlane;
    use crate::storage::TelemetrySpool;
    use tempfile::TempDir;

    async fn emitter(control: Arc<FakeControlPlane>, spool: Option<TelemetrySpool>) -> HeartbeatEmitter {
        let registry = StatusRegistry::new("m-1", 3);
        let spooler = Arc::new(TelemetrySpooler::new(
            "m-1",
            control.clone(),
            spool.map(Arc::new),
            registry.clone(),
            Duration::from_secs(2),
            100,
        ));
        let in_flight = InFlightCommands::default();
        in_flight.try_claim("c1").await;
        HeartbeatEmitter::new(
            MachineIdentity {
                machine_id: "m-1".to_string(),
                label: Some("lab-east".to_string()),
            },
            control,
            spooler,
            registry,
            in_flight,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_carries_machine_status() {
        let control = Arc::new(FakeControlPlane::default());
        let emitter = emitter(control.clone(), None).await;

        emitter.beat_once().await.unwrap();

        let sent = control.telemetry.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let TelemetryEvent::Heartbeat(heartbeat) = &sent[0].event else {
            panic!("expected heartbeat, got {:?}", sent[0].event);
        };
        assert_eq!(heartbeat.machine_label.as_deref(), Some("lab-east"));
        assert_eq!(heartbeat.in_flight_commands, 1);
    }

    #[tokio::test]
    async fn test_failed_heartbeat_is_spooled_when_enabled() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(FakeControlPlane::default());
        let spool = TelemetrySpool::open(dir.path().join("telemetry-spool.json"), 10).await;
        let emitter = emitter(control.clone(), Some(spool)).await;

        FakeControlPlane::fail_next(&control.telemetry_failures, 1);
        assert!(emitter.beat_once().await.is_err());
        assert_eq!(emitter.spooler.depth().await, 1);

        emitter.spooler.flush_once().await.unwrap();
        let sent = control.telemetry.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event.kind(), "heartbeat");
        assert!(sent[0].sequence_id.is_some());
    }

    #[tokio::test]
    async fn test_failed_heartbeat_is_dropped_when_disabled() {
        let control = Arc::new(FakeControlPlane::default());
        let emitter = emitter(control.clone(), None).await;

        FakeControlPlane::fail_next(&control.telemetry_failures, 1);
        assert!(emitter.beat_once().await.is_err());
        assert_eq!(emitter.spooler.depth().await, 0);
        assert!(control.telemetry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_spool_surfaces_storage_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let control = Arc::new(FakeControlPlane::default());
        let spool = TelemetrySpool::open(blocker.join("telemetry-spool.json"), 10).await;
        let emitter = emitter(control.clone(), Some(spool)).await;

        FakeControlPlane::fail_next(&control.telemetry_failures, 1);
        let err = emitter.beat_once().await.unwrap_err();
        assert!(matches!(err, crate::error::AppError::Storage(_)));
    }
}
