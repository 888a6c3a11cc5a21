use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::{TelemetryEnvelope, TelemetryEvent};
use crate::services::control_plane::ControlPlane;
use crate::services::status_registry::{COMPONENT_TELEMETRY, StatusRegistry};
use crate::storage::TelemetrySpool;

/// Ordered outbox for telemetry.
///
/// With a spool, events are delivered strictly head first; a failed head
/// blocks everything behind it until it succeeds or is evicted by overflow.
/// Without one, each event gets a single direct delivery attempt.
pub struct TelemetrySpooler {
    machine_id: String,
    control: Arc<dyn ControlPlane>,
    spool: Option<Arc<TelemetrySpool>>,
    registry: StatusRegistry,
    flush_interval: Duration,
    batch_max: usize,
    flush_gate: Mutex<()>,
}

impl TelemetrySpooler {
    pub fn new(
        machine_id: impl Into<String>,
        control: Arc<dyn ControlPlane>,
        spool: Option<Arc<TelemetrySpool>>,
        registry: StatusRegistry,
        flush_interval: Duration,
        batch_max: usize,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            control,
            spool,
            registry,
            flush_interval,
            batch_max: batch_max.max(1),
            flush_gate: Mutex::new(()),
        }
    }

    pub fn is_spooling(&self) -> bool {
        self.spool.is_some()
    }

    pub async fn depth(&self) -> usize {
        match &self.spool {
            Some(spool) => spool.len().await,
            None => 0,
        }
    }

    pub async fn dropped(&self) -> u64 {
        match &self.spool {
            Some(spool) => spool.dropped().await,
            None => 0,
        }
    }

    /// Queue `event` for ordered delivery, or send it once when spooling is off.
    pub async fn append(&self, event: TelemetryEvent) -> AppResult<()> {
        let Some(spool) = &self.spool else {
            let kind = event.kind().to_string();
            let envelope = TelemetryEnvelope::direct(&self.machine_id, event);
            match self.control.send_telemetry(&envelope).await {
                Ok(()) => self.registry.record_success(COMPONENT_TELEMETRY).await,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "telemetry delivery failed, event discarded");
                    self.registry.record_failure(COMPONENT_TELEMETRY, &e).await;
                }
            }
            return Ok(());
        };

        let entry = spool.append(event).await?;
        debug!(sequence_id = entry.sequence_id, kind = entry.payload.kind(), "telemetry spooled");
        self.publish_counters(spool).await;
        Ok(())
    }

    /// Deliver up to one batch from the head. Returns how many were delivered.
    ///
    /// Stops at the first failure; a tick already in progress makes this a no-op.
    pub async fn flush_once(&self) -> AppResult<usize> {
        let Some(spool) = &self.spool else {
            return Ok(0);
        };
        let Ok(_gate) = self.flush_gate.try_lock() else {
            debug!("telemetry flush already running, skipping tick");
            return Ok(0);
        };

        let mut delivered = 0;
        while delivered < self.batch_max {
            let Some(head) = spool.head().await else {
                break;
            };

            let envelope = TelemetryEnvelope::spooled(&self.machine_id, &head);
            if let Err(e) = self.control.send_telemetry(&envelope).await {
                self.registry.record_failure(COMPONENT_TELEMETRY, &e).await;
                self.publish_counters(spool).await;
                return Err(e);
            }

            if !spool.ack(head.sequence_id).await? {
                debug!(sequence_id = head.sequence_id, "delivered event was evicted meanwhile");
            }
            delivered += 1;
        }

        self.registry.record_success(COMPONENT_TELEMETRY).await;
        self.publish_counters(spool).await;
        Ok(delivered)
    }

    async fn publish_counters(&self, spool: &TelemetrySpool) {
        self.registry
            .set_detail(COMPONENT_TELEMETRY, "spoolDepth", spool.len().await)
            .await;
        self.registry
            .set_detail(COMPONENT_TELEMETRY, "dropped", spool.dropped().await)
            .await;
        self.registry
            .set_detail(COMPONENT_TELEMETRY, "spoolCapacity", spool.capacity())
            .await;
    }

    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.is_spooling() {
            info!("telemetry spooling disabled, flush loop not started");
            return;
        }

        info!(
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            batch_max = self.batch_max,
            "telemetry flush loop starting"
        );
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("telemetry flush loop stopping");
                    break;
                }

                _ = ticker.tick() => {
                    match self.flush_once().await {
                        Ok(0) => {}
                        Ok(delivered) => debug!(delivered, "telemetry flushed"),
                        Err(e) => warn!(error = %e, "telemetry flush stopped at head"),
                    }
                }
            }
        }
    }
}
