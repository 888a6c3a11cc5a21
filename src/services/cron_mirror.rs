use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RetryConfig, RetryExecutor};
use crate::error::{AppError, AppResult};
use crate::models::{
    CRON_SOURCE_PREFIX, CronDiff, CronJob, CronJobSnapshot, CronOffset, CronSyncRequest,
    CronTombstone, source_id_for,
};
use crate::services::control_plane::ControlPlane;
use crate::services::status_registry::{COMPONENT_CRON, StatusRegistry};
use crate::storage::OffsetStore;

/// Where the local cron job definitions come from
#[async_trait]
pub trait CronSource: Send + Sync {
    async fn load_jobs(&self) -> AppResult<Vec<CronJob>>;
}

/// Jobs file holding either `[job, ...]` or `{"jobs": [job, ...]}`
#[derive(Debug, Clone)]
pub struct JsonFileCronSource {
    path: PathBuf,
}

impl JsonFileCronSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(&self, bytes: &[u8]) -> AppResult<Vec<CronJob>> {
        let document: JsonValue = serde_json::from_slice(bytes)?;
        let entries = match document {
            JsonValue::Array(entries) => entries,
            JsonValue::Object(mut map) => match map.remove("jobs") {
                Some(JsonValue::Array(entries)) => entries,
                Some(JsonValue::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(AppError::config(format!(
                        "{}: \"jobs\" must be an array",
                        self.path.display()
                    )));
                }
            },
            _ => {
                return Err(AppError::config(format!(
                    "{}: expected an array of jobs or an object with \"jobs\"",
                    self.path.display()
                )));
            }
        };

        entries
            .into_iter()
            .enumerate()
            .map(|(index, definition)| {
                let id = definition
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        AppError::config(format!(
                            "{}: job #{} has no string \"id\"",
                            self.path.display(),
                            index
                        ))
                    })?;
                Ok(CronJob { id, definition })
            })
            .collect()
    }
}

#[async_trait]
impl CronSource for JsonFileCronSource {
    async fn load_jobs(&self) -> AppResult<Vec<CronJob>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => self.parse(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "cron jobs file missing, treating as empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Mirrors local cron definitions to the control plane as deltas
pub struct CronMirror {
    machine_id: String,
    control: Arc<dyn ControlPlane>,
    source: Arc<dyn CronSource>,
    offsets: Arc<OffsetStore>,
    registry: StatusRegistry,
    sync_interval: Duration,
    retry: RetryConfig,
    sync_gate: Mutex<()>,
}

impl CronMirror {
    pub fn new(
        machine_id: impl Into<String>,
        control: Arc<dyn ControlPlane>,
        source: Arc<dyn CronSource>,
        offsets: Arc<OffsetStore>,
        registry: StatusRegistry,
        sync_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            control,
            source,
            offsets,
            registry,
            sync_interval,
            retry,
            sync_gate: Mutex::new(()),
        }
    }

    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            sync_interval_ms = self.sync_interval.as_millis() as u64,
            "cron mirror starting"
        );
        let mut ticker = interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("cron mirror stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %e, "cron sync failed");
                    }
                }
            }
        }
    }

    /// Compare the local job set with the synced offsets.
    pub async fn compute_diff(&self, jobs: Vec<CronJob>) -> CronDiff {
        let mut current: BTreeMap<String, CronJob> = BTreeMap::new();
        for job in jobs {
            if current.contains_key(&job.id) {
                warn!(job_id = %job.id, "duplicate cron job id, last definition wins");
            }
            current.insert(job.id.clone(), job);
        }

        let previous: BTreeMap<String, CronOffset> = self
            .offsets
            .list(CRON_SOURCE_PREFIX)
            .await
            .into_iter()
            .map(|offset| {
                let job_id = offset.source_id[CRON_SOURCE_PREFIX.len()..].to_string();
                (job_id, offset)
            })
            .collect();

        let mut diff = CronDiff::default();
        for (job_id, job) in &current {
            let fingerprint = job.fingerprint();
            let snapshot = CronJobSnapshot {
                job_id: job_id.clone(),
                fingerprint: fingerprint.clone(),
                job: job.definition.clone(),
            };
            match previous.get(job_id) {
                None => diff.added.push(snapshot),
                Some(offset) if offset.fingerprint != fingerprint => diff.changed.push(snapshot),
                Some(_) => {}
            }
        }

        let removed_at = Utc::now();
        for (job_id, offset) in &previous {
            if !current.contains_key(job_id) {
                diff.removed.push(CronTombstone {
                    job_id: job_id.clone(),
                    fingerprint: offset.fingerprint.clone(),
                    removed_at,
                });
            }
        }

        diff
    }

    /// One sync round. Offsets move only after the control plane accepts the delta.
    pub async fn sync_once(&self) -> AppResult<CronDiff> {
        let Ok(_gate) = self.sync_gate.try_lock() else {
            debug!("cron sync already running, skipping tick");
            return Ok(CronDiff::default());
        };

        let jobs = match self.source.load_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.registry.record_failure(COMPONENT_CRON, &e).await;
                return Err(e);
            }
        };

        let diff = self.compute_diff(jobs).await;
        if diff.is_empty() {
            self.registry.record_success(COMPONENT_CRON).await;
            return Ok(diff);
        }

        let request = CronSyncRequest {
            machine_id: self.machine_id.clone(),
            added: diff.added.clone(),
            changed: diff.changed.clone(),
            removed: diff.removed.clone(),
        };
        let pushed = RetryExecutor::new(self.retry.clone())
            .execute_with_retry(|| self.control.push_cron_diff(&request), "cron sync")
            .await;
        if let Err(e) = pushed {
            self.registry.record_failure(COMPONENT_CRON, &e).await;
            return Err(e);
        }

        let synced_at = Utc::now();
        let upserts = diff
            .added
            .iter()
            .chain(diff.changed.iter())
            .map(|snapshot| CronOffset {
                source_id: source_id_for(&snapshot.job_id),
                fingerprint: snapshot.fingerprint.clone(),
                last_synced_at: synced_at,
            })
            .collect();
        let removals = diff
            .removed
            .iter()
            .map(|tombstone| source_id_for(&tombstone.job_id))
            .collect();
        self.offsets.commit(upserts, removals).await?;

        info!(
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "cron jobs synced"
        );
        self.registry.record_success(COMPONENT_CRON).await;
        self.registry
            .set_detail(COMPONENT_CRON, "lastPushed", diff.len())
            .await;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::FakeControlPlane;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        control: Arc<FakeControlPlane>,
        offsets: Arc<OffsetStore>,
        mirror: CronMirror,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(FakeControlPlane::default());
        let offsets = Arc::new(OffsetStore::open(dir.path().join("cron-offsets.json")).await);
        let mirror = CronMirror::new(
            "m-1",
            control.clone(),
            Arc::new(JsonFileCronSource::new(dir.path().join("jobs.json"))),
            offsets.clone(),
            StatusRegistry::new("m-1", 1),
            Duration::from_secs(30),
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
        );
        Harness {
            dir,
            control,
            offsets,
            mirror,
        }
    }

    fn write_jobs(dir: &TempDir, jobs: JsonValue) {
        std::fs::write(dir.path().join("jobs.json"), jobs.to_string()).unwrap();
    }

    fn ids(snapshots: &[CronJobSnapshot]) -> Vec<&str> {
        snapshots.iter().map(|s| s.job_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_mutated_job_set_pushes_exact_delta() {
        let h = harness().await;
        write_jobs(
            &h.dir,
            json!([
                {"id": "A", "schedule": "0 * * * *"},
                {"id": "B", "schedule": "*/5 * * * *"}
            ]),
        );
        let first = h.mirror.sync_once().await.unwrap();
        assert_eq!(ids(&first.added), vec!["A", "B"]);
        let old_a = h.offsets.get("cron:A").await.unwrap();

        write_jobs(
            &h.dir,
            json!({"jobs": [
                {"id": "A", "schedule": "30 * * * *"},
                {"id": "C", "schedule": "@daily"}
            ]}),
        );

        FakeControlPlane::fail_next(&h.control.cron_failures, 1);
        assert!(h.mirror.sync_once().await.is_err());
        assert_eq!(h.offsets.get("cron:A").await.unwrap(), old_a);
        assert!(h.offsets.get("cron:B").await.is_some());
        assert!(h.offsets.get("cron:C").await.is_none());

        let diff = h.mirror.sync_once().await.unwrap();
        assert_eq!(ids(&diff.changed), vec!["A"]);
        assert_eq!(ids(&diff.added), vec!["C"]);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].job_id, "B");

        assert_ne!(h.offsets.get("cron:A").await.unwrap().fingerprint, old_a.fingerprint);
        assert!(h.offsets.get("cron:B").await.is_none());
        assert!(h.offsets.get("cron:C").await.is_some());
        assert_eq!(h.control.cron_pushes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_set_makes_no_call() {
        let h = harness().await;
        write_jobs(&h.dir, json!([{"id": "A", "schedule": "@hourly"}]));
        h.mirror.sync_once().await.unwrap();

        let diff = h.mirror.sync_once().await.unwrap();
        assert!(diff.is_empty());
        assert_eq!(h.control.cron_pushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_and_malformed_fails() {
        let h = harness().await;
        assert!(h.mirror.sync_once().await.unwrap().is_empty());

        std::fs::write(h.dir.path().join("jobs.json"), "{ nope").unwrap();
        assert!(h.mirror.sync_once().await.is_err());
        let health = h.mirror.registry.component(COMPONENT_CRON).await.unwrap();
        assert_eq!(health.state, crate::models::HealthState::Degraded);
        assert!(h.control.cron_pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_last_wins() {
        let h = harness().await;
        write_jobs(
            &h.dir,
            json!([
                {"id": "A", "schedule": "first"},
                {"id": "A", "schedule": "second"}
            ]),
        );
        let diff = h.mirror.sync_once().await.unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].job["schedule"], "second");
    }

    #[test]
    fn test_job_without_id_is_rejected() {
        let source = JsonFileCronSource::new("jobs.json");
        assert!(source.parse(br#"[{"schedule": "@daily"}]"#).is_err());
        assert!(source.parse(br#"{"jobs": 3}"#).is_err());
        assert!(source.parse(br#"{"jobs": null}"#).unwrap().is_empty());
    }
}
