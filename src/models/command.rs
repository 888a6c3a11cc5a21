use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A command handed out by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: String,
    pub intent: String,
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Delivery attempt as counted by the control plane
    #[serde(default)]
    pub attempt: u32,
}

/// Terminal outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    /// Completed without a result payload
    Ack,
    Result,
    Failed,
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Ack => write!(f, "ack"),
            CommandOutcome::Result => write!(f, "result"),
            CommandOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Whether a receipt's outcome has reached the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptDelivery {
    #[default]
    Pending,
    Reported,
    /// Reporting exhausted its retries; only resent on redelivery
    Orphaned,
}

/// Durable record of a finished command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub command_id: String,
    pub outcome: CommandOutcome,
    #[serde(default)]
    pub payload: JsonValue,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery: ReceiptDelivery,
    #[serde(default)]
    pub report_attempts: u32,
}

impl Receipt {
    pub fn new(command_id: impl Into<String>, outcome: CommandOutcome, payload: JsonValue) -> Self {
        Self {
            command_id: command_id.into(),
            outcome,
            payload,
            completed_at: Utc::now(),
            delivery: ReceiptDelivery::Pending,
            report_attempts: 0,
        }
    }

    /// Body sent to the result endpoint; identical for every resend
    pub fn report(&self) -> ResultReport {
        ResultReport {
            outcome: self.outcome,
            payload: self.payload.clone(),
        }
    }
}

/// Body of the result endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub outcome: CommandOutcome,
    pub payload: JsonValue,
}

/// What the executor produced for one command
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub outcome: CommandOutcome,
    pub payload: JsonValue,
}

impl ExecutionOutcome {
    pub fn result(payload: JsonValue) -> Self {
        let outcome = if payload.is_null() {
            CommandOutcome::Ack
        } else {
            CommandOutcome::Result
        };
        Self { outcome, payload }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::Failed,
            payload: serde_json::json!({ "error": message.into() }),
        }
    }
}

/// Lifecycle of a command inside this bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Received,
    Leased,
    Renewing,
    Completed,
    Orphaned,
}

/// Body for the poll endpoint and the per-command ack/heartbeat endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRequest {
    pub machine_id: String,
}

/// Response of the poll endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Response of the heartbeat endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRenewal {
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}
