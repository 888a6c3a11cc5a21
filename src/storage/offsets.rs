use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::document::JsonDocument;
use crate::error::AppResult;
use crate::models::CronOffset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OffsetEntry {
    fingerprint: String,
    last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OffsetLedger {
    #[serde(default)]
    offsets: BTreeMap<String, OffsetEntry>,
}

/// Sync cursors keyed by source id
#[derive(Debug)]
pub struct OffsetStore {
    doc: JsonDocument<OffsetLedger>,
}

impl OffsetStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: JsonDocument::open(path).await,
        }
    }

    pub async fn get(&self, source_id: &str) -> Option<CronOffset> {
        self.doc
            .read(|l| l.offsets.get(source_id).map(|e| to_offset(source_id, e)))
            .await
    }

    /// All offsets whose source id starts with `prefix`.
    pub async fn list(&self, prefix: &str) -> Vec<CronOffset> {
        self.doc
            .read(|l| {
                l.offsets
                    .range(prefix.to_string()..)
                    .take_while(|(id, _)| id.starts_with(prefix))
                    .map(|(id, e)| to_offset(id, e))
                    .collect()
            })
            .await
    }

    /// Apply an acknowledged sync in one write.
    pub async fn commit(&self, upserts: Vec<CronOffset>, removals: Vec<String>) -> AppResult<()> {
        self.doc
            .update(move |ledger| {
                for offset in upserts {
                    ledger.offsets.insert(
                        offset.source_id,
                        OffsetEntry {
                            fingerprint: offset.fingerprint,
                            last_synced_at: offset.last_synced_at,
                        },
                    );
                }
                for source_id in removals {
                    ledger.offsets.remove(&source_id);
                }
            })
            .await
    }
}

fn to_offset(source_id: &str, entry: &OffsetEntry) -> CronOffset {
    CronOffset {
        source_id: source_id.to_string(),
        fingerprint: entry.fingerprint.clone(),
        last_synced_at: entry.last_synced_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn offset(id: &str, fp: &str) -> CronOffset {
        CronOffset {
            source_id: id.to_string(),
            fingerprint: fp.to_string(),
            last_synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_and_list_by_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cron-offsets.json");
        let store = OffsetStore::open(&path).await;

        store
            .commit(
                vec![offset("cron:a", "fa"), offset("cron:b", "fb"), offset("other:x", "fx")],
                vec![],
            )
            .await
            .unwrap();
        store.commit(vec![offset("cron:a", "fa2")], vec!["cron:b".into()]).await.unwrap();

        let reopened = OffsetStore::open(&path).await;
        let cron = reopened.list("cron:").await;
        assert_eq!(cron.len(), 1);
        assert_eq!(cron[0].source_id, "cron:a");
        assert_eq!(cron[0].fingerprint, "fa2");
        assert!(reopened.get("other:x").await.is_some());
        assert!(reopened.get("cron:b").await.is_none());
    }
}
