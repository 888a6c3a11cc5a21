//! In-memory fakes shared by the service tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{AppError, AppResult};
use crate::models::{
    Command, CronSyncRequest, ExecutionOutcome, LeaseRenewal, ResultReport, TelemetryEnvelope,
};
use crate::services::command_executor::CommandExecutor;
use crate::services::control_plane::ControlPlane;

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct FakeControlPlane {
    pub poll_queue: Mutex<VecDeque<AppResult<Vec<Command>>>>,
    pub poll_calls: AtomicUsize,
    /// Time each poll takes before answering
    pub poll_delay: Mutex<Duration>,
    pub acks: Mutex<Vec<String>>,
    /// command id -> status returned by ack
    pub ack_rejections: Mutex<HashMap<String, u16>>,
    pub heartbeats: Mutex<Vec<(String, Instant)>>,
    pub heartbeat_failures: AtomicU32,
    /// (command id, serialized body)
    pub results: Mutex<Vec<(String, Vec<u8>)>>,
    pub result_failures: AtomicU32,
    pub cron_pushes: Mutex<Vec<CronSyncRequest>>,
    pub cron_failures: AtomicU32,
    pub telemetry: Mutex<Vec<TelemetryEnvelope>>,
    pub telemetry_failures: AtomicU32,
}

impl FakeControlPlane {
    pub fn queue_poll(&self, commands: Vec<Command>) {
        self.poll_queue.lock().unwrap().push_back(Ok(commands));
    }

    pub fn queue_poll_error(&self, status: u16) {
        self.poll_queue
            .lock()
            .unwrap()
            .push_back(Err(AppError::control_plane(status, "unavailable")));
    }

    pub fn fail_next(counter: &AtomicU32, n: u32) {
        counter.store(n, Ordering::SeqCst);
    }

    pub fn result_bodies(&self, command_id: &str) -> Vec<Vec<u8>> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == command_id)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn heartbeat_count(&self, command_id: &str) -> usize {
        self.heartbeats
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == command_id)
            .count()
    }

    pub fn telemetry_kinds(&self) -> Vec<String> {
        self.telemetry
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.kind().to_string())
            .collect()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn poll_commands(&self, _machine_id: &str) -> AppResult<Vec<Command>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.poll_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.poll_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn ack(&self, _machine_id: &str, command_id: &str) -> AppResult<()> {
        if let Some(status) = self.ack_rejections.lock().unwrap().get(command_id) {
            return Err(AppError::control_plane(*status, "lease held elsewhere"));
        }
        self.acks.lock().unwrap().push(command_id.to_string());
        Ok(())
    }

    async fn heartbeat(&self, _machine_id: &str, command_id: &str) -> AppResult<LeaseRenewal> {
        self.heartbeats
            .lock()
            .unwrap()
            .push((command_id.to_string(), Instant::now()));
        if take_failure(&self.heartbeat_failures) {
            return Err(AppError::control_plane(503, "renewal unavailable"));
        }
        Ok(LeaseRenewal::default())
    }

    async fn report_result(&self, command_id: &str, report: &ResultReport) -> AppResult<()> {
        if take_failure(&self.result_failures) {
            return Err(AppError::control_plane(503, "result endpoint down"));
        }
        let body = serde_json::to_vec(report)?;
        self.results
            .lock()
            .unwrap()
            .push((command_id.to_string(), body));
        Ok(())
    }

    async fn push_cron_diff(&self, request: &CronSyncRequest) -> AppResult<()> {
        if take_failure(&self.cron_failures) {
            return Err(AppError::control_plane(503, "cron sync down"));
        }
        self.cron_pushes.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn send_telemetry(&self, envelope: &TelemetryEnvelope) -> AppResult<()> {
        if take_failure(&self.telemetry_failures) {
            return Err(AppError::control_plane(503, "telemetry down"));
        }
        self.telemetry.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Executor that sleeps for `delay` and returns `outcome`, counting calls per command.
pub struct FakeExecutor {
    pub delay: Duration,
    pub outcome: ExecutionOutcome,
    pub executions: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(delay: Duration, outcome: ExecutionOutcome) -> Self {
        Self {
            delay,
            outcome,
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, command_id: &str) -> usize {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == command_id)
            .count()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, command: &Command) -> ExecutionOutcome {
        self.executions
            .lock()
            .unwrap()
            .push(command.command_id.clone());
        tokio::time::sleep(self.delay).await;
        self.outcome.clone()
    }
}

pub fn command(id: &str) -> Command {
    Command {
        command_id: id.to_string(),
        intent: "agent.status".to_string(),
        args: serde_json::Value::Null,
        lease_expires_at: None,
        attempt: 0,
    }
}
