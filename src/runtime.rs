//! Bridge wiring: builds every component from one config snapshot, runs the
//! loops, and tears them down in order.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::error::AppResult;
use crate::handlers::AppState;
use crate::routes::serve_health;
use crate::services::status_registry::{
    COMPONENT_COMMANDS, COMPONENT_CRON, COMPONENT_HEARTBEAT, COMPONENT_TELEMETRY,
};
use crate::services::{
    CliCommandExecutor, CommandExecutor, CommandLeaseClient, ControlPlane, CronMirror, CronSource,
    HeartbeatEmitter, HttpControlPlane, InFlightCommands, JsonFileCronSource, LeaseSettings,
    StatusRegistry, TelemetrySpooler,
};
use crate::storage::{MachineIdentity, OffsetStore, ReceiptStore, TelemetrySpool};

pub struct BridgeRuntime {
    config: Arc<BridgeConfig>,
    identity: MachineIdentity,
    registry: StatusRegistry,
    lease_client: Arc<CommandLeaseClient>,
    cron_mirror: Arc<CronMirror>,
    heartbeat: Arc<HeartbeatEmitter>,
    spooler: Arc<TelemetrySpooler>,
    shutdown: CancellationToken,
    loops: JoinSet<()>,
}

impl BridgeRuntime {
    /// Build the production runtime: HTTP control plane, CLI executor, jobs file.
    pub async fn init(config: BridgeConfig) -> AppResult<Self> {
        let control: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
            config.control.clone(),
            config.intervals.request_timeout(),
        )?);
        let executor: Arc<dyn CommandExecutor> = Arc::new(CliCommandExecutor::new(
            config.executor.cli_bin.clone(),
            config.executor.execution_timeout(),
        ));
        let cron_source: Arc<dyn CronSource> =
            Arc::new(JsonFileCronSource::new(config.cron.jobs_file.clone()));

        Self::init_with(config, control, executor, cron_source).await
    }

    /// Build the runtime around the given collaborators.
    pub async fn init_with(
        config: BridgeConfig,
        control: Arc<dyn ControlPlane>,
        executor: Arc<dyn CommandExecutor>,
        cron_source: Arc<dyn CronSource>,
    ) -> AppResult<Self> {
        let config = Arc::new(config);
        let storage = &config.storage;

        let identity = MachineIdentity::load_or_create(
            config.machine.machine_id.as_deref(),
            config.machine.label.clone(),
            &storage.machine_id_path(),
        )
        .await?;
        info!(
            machine_id = %identity.machine_id,
            state_dir = %storage.state_dir.display(),
            "bridge identity resolved"
        );

        let registry = StatusRegistry::new(
            identity.machine_id.clone(),
            config.executor.degraded_after_failures,
        );
        for component in [
            COMPONENT_COMMANDS,
            COMPONENT_CRON,
            COMPONENT_HEARTBEAT,
            COMPONENT_TELEMETRY,
        ] {
            registry.register(component).await;
        }

        let receipts =
            Arc::new(ReceiptStore::open(storage.receipt_path(), storage.receipt_retention()).await);
        let offsets = Arc::new(OffsetStore::open(storage.cron_offset_path()).await);
        let spool = if config.telemetry.spool_enabled {
            Some(Arc::new(
                TelemetrySpool::open(storage.telemetry_spool_path(), config.telemetry.spool_capacity)
                    .await,
            ))
        } else {
            None
        };

        let spooler = Arc::new(TelemetrySpooler::new(
            identity.machine_id.clone(),
            control.clone(),
            spool,
            registry.clone(),
            config.intervals.telemetry_flush_interval(),
            config.telemetry.flush_batch_max,
        ));

        let in_flight = InFlightCommands::default();
        let lease_client = Arc::new(CommandLeaseClient::new(
            identity.machine_id.clone(),
            control.clone(),
            executor,
            receipts,
            spooler.clone(),
            registry.clone(),
            in_flight.clone(),
            LeaseSettings::from_config(&config),
        ));

        let cron_mirror = Arc::new(CronMirror::new(
            identity.machine_id.clone(),
            control.clone(),
            cron_source,
            offsets,
            registry.clone(),
            config.intervals.cron_sync_interval(),
            config.retry.capped_at(config.intervals.cron_sync_interval()),
        ));

        let heartbeat = Arc::new(HeartbeatEmitter::new(
            identity.clone(),
            control,
            spooler.clone(),
            registry.clone(),
            in_flight,
            config.intervals.heartbeat_interval(),
        ));

        Ok(Self {
            config,
            identity,
            registry,
            lease_client,
            cron_mirror,
            heartbeat,
            spooler,
            shutdown: CancellationToken::new(),
            loops: JoinSet::new(),
        })
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the poll, cron, heartbeat and flush loops, plus the health server when enabled.
    pub fn start(&mut self) -> AppResult<()> {
        let token = self.shutdown.clone();

        self.loops
            .spawn(Arc::clone(&self.lease_client).start(token.child_token()));
        self.loops
            .spawn(Arc::clone(&self.cron_mirror).start(token.child_token()));
        self.loops
            .spawn(Arc::clone(&self.heartbeat).start(token.child_token()));
        self.loops
            .spawn(Arc::clone(&self.spooler).start(token.child_token()));

        if self.config.health.enabled {
            let addr = self.config.health.socket_addr()?;
            let state = AppState {
                registry: self.registry.clone(),
            };
            let health_token = token.child_token();
            self.loops.spawn(async move {
                if let Err(e) = serve_health(addr, state, health_token).await {
                    error!(error = %e, "health server failed");
                }
            });
        }

        info!(
            machine_id = %self.identity.machine_id,
            version = crate::BRIDGE_VERSION,
            "bridge started"
        );
        Ok(())
    }

    /// Stop the loops, give in-flight commands the grace period, then flush telemetry once.
    pub async fn shutdown(mut self) -> AppResult<()> {
        info!("bridge shutting down");
        self.shutdown.cancel();

        while let Some(joined) = self.loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "bridge loop panicked");
            }
        }

        let abandoned = self
            .lease_client
            .drain(self.config.intervals.shutdown_grace())
            .await;
        if abandoned > 0 {
            warn!(abandoned, "commands still running at shutdown will be redelivered");
        }

        if let Err(e) = self.spooler.flush_once().await {
            warn!(error = %e, "final telemetry flush failed, events stay spooled");
        }

        info!("bridge stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandOutcome, ExecutionOutcome, ReceiptDelivery};
    use crate::services::testing::{FakeControlPlane, FakeExecutor, command};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.storage.state_dir = dir.path().to_path_buf();
        config.cron.jobs_file = dir.path().join("jobs.json");
        config.health.enabled = false;
        config.machine.label = Some("bench".to_string());
        config.normalized()
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_runs_command_and_shuts_down_cleanly() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("jobs.json"), r#"[{"id": "nightly", "schedule": "@daily"}]"#)
            .unwrap();

        let control = Arc::new(FakeControlPlane::default());
        control.queue_poll(vec![command("c1")]);
        let executor = Arc::new(FakeExecutor::new(
            Duration::from_secs(3),
            ExecutionOutcome::result(json!({"ok": true})),
        ));
        let cron_source = Arc::new(JsonFileCronSource::new(dir.path().join("jobs.json")));

        let mut runtime =
            BridgeRuntime::init_with(config(&dir), control.clone(), executor.clone(), cron_source)
                .await
                .unwrap();
        let machine_id = runtime.identity().machine_id.clone();
        runtime.start().unwrap();

        tokio::time::sleep(Duration::from_secs(12)).await;
        runtime.shutdown().await.unwrap();

        assert_eq!(executor.count("c1"), 1);
        assert_eq!(control.result_bodies("c1").len(), 1);
        assert_eq!(control.cron_pushes.lock().unwrap().len(), 1);
        assert!(control.telemetry_kinds().contains(&"heartbeat".to_string()));
        assert!(control.telemetry_kinds().contains(&"command.completed".to_string()));

        let receipts = ReceiptStore::open(dir.path().join("receipts.json"), chrono::Duration::days(7)).await;
        let receipt = receipts.get("c1").await.unwrap();
        assert_eq!(receipt.outcome, CommandOutcome::Result);
        assert_eq!(receipt.delivery, ReceiptDelivery::Reported);

        let stored_id = std::fs::read_to_string(dir.path().join("machine-id")).unwrap();
        assert_eq!(stored_id.trim(), machine_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resends_pending_receipt_without_executing() {
        let dir = TempDir::new().unwrap();
        {
            let receipts =
                ReceiptStore::open(dir.path().join("receipts.json"), chrono::Duration::days(7)).await;
            receipts
                .put(crate::models::Receipt::new("c7", CommandOutcome::Failed, json!({"error": "boom"})))
                .await
                .unwrap();
        }

        let control = Arc::new(FakeControlPlane::default());
        control.queue_poll(vec![command("c7")]);
        let executor = Arc::new(FakeExecutor::new(
            Duration::from_secs(1),
            ExecutionOutcome::result(json!(null)),
        ));
        let cron_source = Arc::new(JsonFileCronSource::new(dir.path().join("jobs.json")));

        let mut runtime =
            BridgeRuntime::init_with(config(&dir), control.clone(), executor.clone(), cron_source)
                .await
                .unwrap();
        runtime.start().unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        runtime.shutdown().await.unwrap();

        assert_eq!(executor.count("c7"), 0);
        let bodies = control.result_bodies("c7");
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], bodies[1]);
    }
}
