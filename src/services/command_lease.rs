//! Command lease protocol.
//!
//! Poll, claim with an ack, execute concurrently, keep the lease alive while
//! running, persist the outcome, then report it. A command that already has a
//! receipt is never executed again; its stored outcome is re-sent instead.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, RetryConfig, RetryExecutor};
use crate::error::AppResult;
use crate::models::{Command, CommandState, Receipt, TelemetryEvent};
use crate::services::command_executor::CommandExecutor;
use crate::services::control_plane::ControlPlane;
use crate::services::status_registry::{COMPONENT_COMMANDS, StatusRegistry};
use crate::services::telemetry_spooler::TelemetrySpooler;
use crate::storage::ReceiptStore;

/// Commands currently owned by this process, shared with the heartbeat emitter
#[derive(Clone, Debug, Default)]
pub struct InFlightCommands {
    inner: Arc<RwLock<HashMap<String, CommandState>>>,
}

impl InFlightCommands {
    /// Register `command_id` as received. False if it is already in flight.
    pub async fn try_claim(&self, command_id: &str) -> bool {
        let mut commands = self.inner.write().await;
        if commands.contains_key(command_id) {
            return false;
        }
        commands.insert(command_id.to_string(), CommandState::Received);
        true
    }

    pub async fn set(&self, command_id: &str, state: CommandState) {
        if let Some(current) = self.inner.write().await.get_mut(command_id) {
            *current = state;
        }
    }

    pub async fn state(&self, command_id: &str) -> Option<CommandState> {
        self.inner.read().await.get(command_id).copied()
    }

    pub async fn contains(&self, command_id: &str) -> bool {
        self.inner.read().await.contains_key(command_id)
    }

    pub async fn release(&self, command_id: &str) {
        self.inner.write().await.remove(command_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Timing and retry knobs for the lease client
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub renewal_period: Duration,
    pub result_report_attempts: u32,
    pub retry: RetryConfig,
}

impl LeaseSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        let poll_interval = config.intervals.poll_interval();
        Self {
            poll_interval,
            lease_ttl: config.intervals.lease_ttl(),
            renewal_period: config.intervals.renewal_period(),
            result_report_attempts: config.executor.result_report_attempts,
            retry: config.retry.capped_at(poll_interval),
        }
    }
}

/// What became of one polled command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acked and handed to the executor
    Started,
    /// A receipt existed; the stored outcome was re-sent
    Resent,
    /// Already executing in this process
    AlreadyRunning,
    /// Another bridge holds the lease
    LeaseConflict,
}

pub struct CommandLeaseClient {
    machine_id: String,
    control: Arc<dyn ControlPlane>,
    executor: Arc<dyn CommandExecutor>,
    receipts: Arc<ReceiptStore>,
    spooler: Arc<TelemetrySpooler>,
    registry: StatusRegistry,
    in_flight: InFlightCommands,
    settings: LeaseSettings,
    poll_gate: Mutex<()>,
    tasks: Mutex<JoinSet<()>>,
}

impl CommandLeaseClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine_id: impl Into<String>,
        control: Arc<dyn ControlPlane>,
        executor: Arc<dyn CommandExecutor>,
        receipts: Arc<ReceiptStore>,
        spooler: Arc<TelemetrySpooler>,
        registry: StatusRegistry,
        in_flight: InFlightCommands,
        settings: LeaseSettings,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            control,
            executor,
            receipts,
            spooler,
            registry,
            in_flight,
            settings,
            poll_gate: Mutex::new(()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn in_flight(&self) -> &InFlightCommands {
        &self.in_flight
    }

    /// Poll loop. Pending receipts from a previous run are re-sent before the first poll.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) {
        let recovered = self.recover_pending_receipts().await;
        if recovered > 0 {
            info!(recovered, "re-sent receipts left pending by the previous run");
        }

        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            lease_ttl_ms = self.settings.lease_ttl.as_millis() as u64,
            renewal_period_ms = self.settings.renewal_period.as_millis() as u64,
            "command poll loop starting"
        );
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("command poll loop stopping");
                    break;
                }

                _ = ticker.tick() => {
                    self.reap_finished().await;
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "command poll failed");
                    }
                }
            }
        }
    }

    /// One poll round. Overlapping calls return immediately with no work done.
    pub async fn poll_once(self: &Arc<Self>) -> AppResult<usize> {
        let Ok(_gate) = self.poll_gate.try_lock() else {
            debug!("previous poll still running, skipping tick");
            return Ok(0);
        };

        let executor = RetryExecutor::new(self.settings.retry.clone());
        let polled = executor
            .execute_with_retry(|| self.control.poll_commands(&self.machine_id), "poll")
            .await;

        let commands = match polled {
            Ok(commands) => {
                self.registry.record_success(COMPONENT_COMMANDS).await;
                commands
            }
            Err(e) => {
                self.registry.record_failure(COMPONENT_COMMANDS, &e).await;
                return Err(e);
            }
        };

        let received = commands.len();
        if received > 0 {
            debug!(received, "commands polled");
        }
        for command in commands {
            let command_id = command.command_id.clone();
            if let Err(e) = self.handle_command(command).await {
                warn!(command_id = %command_id, error = %e, "command not started, will retry on redelivery");
            }
        }

        self.registry
            .set_detail(COMPONENT_COMMANDS, "inFlight", self.in_flight.len().await)
            .await;
        Ok(received)
    }

    pub async fn handle_command(self: &Arc<Self>, command: Command) -> AppResult<Disposition> {
        let command_id = command.command_id.clone();

        if self.in_flight.contains(&command_id).await {
            debug!(command_id = %command_id, "command already running here, ignoring redelivery");
            return Ok(Disposition::AlreadyRunning);
        }

        if let Some(receipt) = self.receipts.get(&command_id).await {
            info!(
                command_id = %command_id,
                outcome = %receipt.outcome,
                attempt = command.attempt,
                "redelivered command has a receipt, re-sending stored outcome"
            );
            self.deliver(receipt).await;
            return Ok(Disposition::Resent);
        }

        if !self.in_flight.try_claim(&command_id).await {
            return Ok(Disposition::AlreadyRunning);
        }

        let acked = RetryExecutor::new(self.settings.retry.clone())
            .execute_with_retry(|| self.control.ack(&self.machine_id, &command_id), "ack")
            .await;
        if let Err(e) = acked {
            self.in_flight.release(&command_id).await;
            if e.is_lease_conflict() {
                info!(command_id = %command_id, error = %e, "lease held by another bridge, skipping");
                return Ok(Disposition::LeaseConflict);
            }
            return Err(e);
        }

        self.in_flight.set(&command_id, CommandState::Leased).await;
        info!(command_id = %command_id, intent = %command.intent, "command leased");

        let client = Arc::clone(self);
        self.tasks.lock().await.spawn(async move {
            client.run_command(command).await;
        });
        Ok(Disposition::Started)
    }

    async fn run_command(self: Arc<Self>, command: Command) {
        let command_id = command.command_id.clone();
        let started = Instant::now();

        let renewal_done = CancellationToken::new();
        let renewer = tokio::spawn(
            Arc::clone(&self).renew_lease(command_id.clone(), renewal_done.clone()),
        );
        // Stop renewing even if this task is aborted mid-execution.
        let _renewal_guard = renewal_done.clone().drop_guard();

        let outcome = self.executor.execute(&command).await;
        renewal_done.cancel();
        let _ = renewer.await;

        debug!(
            command_id = %command_id,
            outcome = %outcome.outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );

        let receipt = Receipt::new(&command_id, outcome.outcome, outcome.payload);
        let receipt = match self.receipts.put(receipt.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(command_id = %command_id, error = %e, "failed to persist receipt, reporting anyway");
                receipt
            }
        };

        self.deliver(receipt).await;
        self.in_flight.release(&command_id).await;
    }

    /// Heartbeat the lease every renewal period until `done` fires.
    ///
    /// A failed renewal is logged and reported but never stops execution.
    async fn renew_lease(self: Arc<Self>, command_id: String, done: CancellationToken) {
        let period = self.settings.renewal_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let retry = RetryExecutor::new(self.settings.retry.capped_at(period / 4));

        loop {
            tokio::select! {
                biased;

                _ = done.cancelled() => break,

                _ = ticker.tick() => {
                    self.in_flight.set(&command_id, CommandState::Renewing).await;
                    let renewed = retry
                        .execute_with_retry(
                            || self.control.heartbeat(&self.machine_id, &command_id),
                            "lease heartbeat",
                        )
                        .await;

                    match renewed {
                        Ok(renewal) => {
                            debug!(command_id = %command_id, lease_expires_at = ?renewal.lease_expires_at, "lease renewed");
                            self.in_flight.set(&command_id, CommandState::Leased).await;
                        }
                        Err(e) => {
                            warn!(
                                command_id = %command_id,
                                error = %e,
                                "lease renewal failed, command may be reassigned and run twice"
                            );
                            self.emit(TelemetryEvent::lifecycle(
                                "command.lease_renewal_failed",
                                json!({ "commandId": command_id, "error": e.to_string() }),
                            ))
                            .await;
                        }
                    }
                }
            }
        }
    }

    /// Report a persisted receipt and record whether it got through.
    async fn deliver(&self, receipt: Receipt) {
        let command_id = receipt.command_id.clone();
        let report = receipt.report();
        let retry = RetryExecutor::new(
            self.settings
                .retry
                .with_max_attempts(self.settings.result_report_attempts),
        );

        let mut attempts = 0u32;
        let reported = retry
            .execute_with_retry(
                || {
                    attempts += 1;
                    self.control.report_result(&command_id, &report)
                },
                "result",
            )
            .await;

        match reported {
            Ok(()) => {
                if let Err(e) = self.receipts.mark_reported(&command_id, attempts).await {
                    warn!(command_id = %command_id, error = %e, "failed to record receipt delivery");
                }
                self.in_flight.set(&command_id, CommandState::Completed).await;
                info!(command_id = %command_id, outcome = %receipt.outcome, attempts, "command result reported");
                self.emit(TelemetryEvent::lifecycle(
                    "command.completed",
                    json!({ "commandId": command_id, "outcome": receipt.outcome }),
                ))
                .await;
            }
            Err(e) => {
                if let Err(store_err) = self.receipts.mark_orphaned(&command_id, attempts).await {
                    warn!(command_id = %command_id, error = %store_err, "failed to record orphaned receipt");
                }
                self.in_flight.set(&command_id, CommandState::Orphaned).await;
                error!(command_id = %command_id, attempts, error = %e, "result reporting exhausted, command orphaned");
                self.emit(TelemetryEvent::lifecycle(
                    "command.orphaned",
                    json!({ "commandId": command_id, "attempts": attempts, "error": e.to_string() }),
                ))
                .await;
            }
        }
    }

    /// Re-send every receipt persisted but never reported. Returns how many were found.
    pub async fn recover_pending_receipts(&self) -> usize {
        let pending = self.receipts.pending().await;
        let count = pending.len();
        for receipt in pending {
            self.deliver(receipt).await;
        }
        count
    }

    async fn emit(&self, event: TelemetryEvent) {
        let kind = event.kind().to_string();
        if let Err(e) = self.spooler.append(event).await {
            warn!(kind = %kind, error = %e, "failed to queue lifecycle event");
        }
    }

    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "command task panicked");
            }
        }
    }

    /// Wait up to `grace` for running commands to finish and report, then abort the rest.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let running = tasks.len();
        if running == 0 {
            return 0;
        }

        info!(running, grace_ms = grace.as_millis() as u64, "waiting for in-flight commands");
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "command task panicked");
                }
            }
        })
        .await;

        if finished.is_err() {
            let abandoned = tasks.len();
            warn!(abandoned, "grace period over, abandoning in-flight commands");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return abandoned;
        }
        0
    }
}
