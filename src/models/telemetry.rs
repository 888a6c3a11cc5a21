use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::health::HealthState;

/// Machine status snapshot, rebuilt on every heartbeat tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineHeartbeat {
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_label: Option<String>,
    pub bridge_version: String,
    pub status: HealthState,
    pub uptime_secs: u64,
    pub in_flight_commands: usize,
    pub spool_depth: usize,
    pub dropped_events: u64,
    pub sent_at: DateTime<Utc>,
}

/// Anything delivered to the telemetry endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Heartbeat(MachineHeartbeat),
    Event { kind: String, data: JsonValue },
}

impl TelemetryEvent {
    pub fn lifecycle(kind: impl Into<String>, data: JsonValue) -> Self {
        Self::Event {
            kind: kind.into(),
            data,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            TelemetryEvent::Heartbeat(_) => "heartbeat",
            TelemetryEvent::Event { kind, .. } => kind,
        }
    }
}

/// One entry of the telemetry spool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpooledEvent {
    pub sequence_id: u64,
    pub payload: TelemetryEvent,
    pub captured_at: DateTime<Utc>,
}

/// Body of the telemetry endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub machine_id: String,
    /// Present only for spooled deliveries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
    pub captured_at: DateTime<Utc>,
    pub event: TelemetryEvent,
}

impl TelemetryEnvelope {
    pub fn direct(machine_id: &str, event: TelemetryEvent) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            sequence_id: None,
            captured_at: Utc::now(),
            event,
        }
    }

    pub fn spooled(machine_id: &str, entry: &SpooledEvent) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            sequence_id: Some(entry.sequence_id),
            captured_at: entry.captured_at,
            event: entry.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagging() {
        let event = TelemetryEvent::lifecycle("command.completed", json!({"commandId": "c1"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["kind"], "command.completed");
        assert_eq!(event.kind(), "command.completed");
    }

    #[test]
    fn test_spooled_envelope_carries_sequence() {
        let entry = SpooledEvent {
            sequence_id: 12,
            payload: TelemetryEvent::lifecycle("command.orphaned", json!({})),
            captured_at: Utc::now(),
        };
        let envelope = TelemetryEnvelope::spooled("m-1", &entry);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["sequenceId"], 12);
        assert_eq!(value["machineId"], "m-1");

        let direct = serde_json::to_value(TelemetryEnvelope::direct("m-1", entry.payload)).unwrap();
        assert!(direct.get("sequenceId").is_none());
    }
}
