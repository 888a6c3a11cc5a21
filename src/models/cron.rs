use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Offset source id prefix for mirrored cron jobs
pub const CRON_SOURCE_PREFIX: &str = "cron:";

/// A job definition read from the local cron store
#[derive(Debug, Clone, PartialEq)]
pub struct CronJob {
    pub id: String,
    /// Full job object as stored locally, `id` included
    pub definition: JsonValue,
}

impl CronJob {
    /// Lowercase hex SHA-256 of the job's canonical JSON (object keys sorted at every level).
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(&canonical_json(&self.definition)).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

fn canonical_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            JsonValue::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical_json(v)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

pub fn source_id_for(job_id: &str) -> String {
    format!("{}{}", CRON_SOURCE_PREFIX, job_id)
}

/// Last acknowledged state of one synced source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronOffset {
    pub source_id: String,
    pub fingerprint: String,
    pub last_synced_at: DateTime<Utc>,
}

/// Added or changed job as pushed to the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSnapshot {
    pub job_id: String,
    pub fingerprint: String,
    pub job: JsonValue,
}

/// Removed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTombstone {
    pub job_id: String,
    /// Fingerprint of the last acknowledged definition
    pub fingerprint: String,
    pub removed_at: DateTime<Utc>,
}

/// Delta between the local job set and the acknowledged offsets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CronDiff {
    pub added: Vec<CronJobSnapshot>,
    pub changed: Vec<CronJobSnapshot>,
    pub removed: Vec<CronTombstone>,
}

impl CronDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }
}

/// Body of the cron-sync endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSyncRequest {
    pub machine_id: String,
    pub added: Vec<CronJobSnapshot>,
    pub changed: Vec<CronJobSnapshot>,
    pub removed: Vec<CronTombstone>,
}
