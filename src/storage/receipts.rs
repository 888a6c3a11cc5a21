use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use super::document::JsonDocument;
use crate::error::AppResult;
use crate::models::{Receipt, ReceiptDelivery};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReceiptLedger {
    #[serde(default)]
    receipts: BTreeMap<String, Receipt>,
}

impl ReceiptLedger {
    /// Drop delivered or orphaned receipts completed before `cutoff`.
    /// Pending receipts are kept until they are reported.
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.receipts.len();
        self.receipts.retain(|_, r| {
            r.delivery == ReceiptDelivery::Pending || r.completed_at >= cutoff
        });
        before - self.receipts.len()
    }
}

/// Idempotency ledger keyed by command id
#[derive(Debug)]
pub struct ReceiptStore {
    doc: JsonDocument<ReceiptLedger>,
    retention: chrono::Duration,
}

impl ReceiptStore {
    pub async fn open(path: impl Into<PathBuf>, retention: chrono::Duration) -> Self {
        Self {
            doc: JsonDocument::open(path).await,
            retention,
        }
    }

    pub async fn get(&self, command_id: &str) -> Option<Receipt> {
        self.doc.read(|l| l.receipts.get(command_id).cloned()).await
    }

    /// Persist `receipt` unless the command already has one.
    ///
    /// Returns the receipt on file afterwards; the first terminal receipt wins.
    pub async fn put(&self, receipt: Receipt) -> AppResult<Receipt> {
        let cutoff = Utc::now() - self.retention;
        self.doc
            .update(move |ledger| {
                let pruned = ledger.prune(cutoff);
                if pruned > 0 {
                    debug!(pruned, "pruned expired receipts");
                }
                ledger
                    .receipts
                    .entry(receipt.command_id.clone())
                    .or_insert(receipt)
                    .clone()
            })
            .await
    }

    pub async fn mark_reported(&self, command_id: &str, attempts: u32) -> AppResult<Option<Receipt>> {
        self.record_delivery(command_id, ReceiptDelivery::Reported, attempts)
            .await
    }

    pub async fn mark_orphaned(&self, command_id: &str, attempts: u32) -> AppResult<Option<Receipt>> {
        self.record_delivery(command_id, ReceiptDelivery::Orphaned, attempts)
            .await
    }

    /// Record a delivery attempt result for an existing receipt.
    async fn record_delivery(
        &self,
        command_id: &str,
        delivery: ReceiptDelivery,
        attempts: u32,
    ) -> AppResult<Option<Receipt>> {
        if self.get(command_id).await.is_none() {
            return Ok(None);
        }
        self.doc
            .update(|ledger| {
                ledger.receipts.get_mut(command_id).map(|r| {
                    r.delivery = delivery;
                    r.report_attempts = r.report_attempts.saturating_add(attempts);
                    r.clone()
                })
            })
            .await
    }

    /// Receipts persisted but never reported, oldest first.
    pub async fn pending(&self) -> Vec<Receipt> {
        let mut pending: Vec<Receipt> = self
            .doc
            .read(|l| {
                l.receipts
                    .values()
                    .filter(|r| r.delivery == ReceiptDelivery::Pending)
                    .cloned()
                    .collect()
            })
            .await;
        pending.sort_by_key(|r| r.completed_at);
        pending
    }

    pub async fn len(&self) -> usize {
        self.doc.read(|l| l.receipts.len()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandOutcome;
    use serde_json::json;
    use tempfile::TempDir;

    fn week() -> chrono::Duration {
        chrono::Duration::days(7)
    }

    #[tokio::test]
    async fn test_put_then_get_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("receipts.json");

        let store = ReceiptStore::open(&path, week()).await;
        store
            .put(Receipt::new("c1", CommandOutcome::Result, json!({"exit": 0})))
            .await
            .unwrap();

        let reopened = ReceiptStore::open(&path, week()).await;
        let receipt = reopened.get("c1").await.unwrap();
        assert_eq!(receipt.outcome, CommandOutcome::Result);
        assert_eq!(receipt.payload, json!({"exit": 0}));
        assert!(reopened.get("c2").await.is_none());
    }

    #[tokio::test]
    async fn test_first_terminal_receipt_wins() {
        let dir = TempDir::new().unwrap();
        let store = ReceiptStore::open(dir.path().join("r.json"), week()).await;

        store
            .put(Receipt::new("c1", CommandOutcome::Result, json!(1)))
            .await
            .unwrap();
        let kept = store
            .put(Receipt::new("c1", CommandOutcome::Failed, json!(2)))
            .await
            .unwrap();

        assert_eq!(kept.outcome, CommandOutcome::Result);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_prunes_delivered_receipts_past_retention() {
        let dir = TempDir::new().unwrap();
        let store = ReceiptStore::open(dir.path().join("r.json"), week()).await;

        let mut old = Receipt::new("old", CommandOutcome::Ack, json!(null));
        old.completed_at = Utc::now() - chrono::Duration::days(30);
        old.delivery = ReceiptDelivery::Reported;
        let mut stuck = Receipt::new("stuck", CommandOutcome::Ack, json!(null));
        stuck.completed_at = Utc::now() - chrono::Duration::days(30);
        store.put(old).await.unwrap();
        store.put(stuck).await.unwrap();

        store
            .put(Receipt::new("new", CommandOutcome::Ack, json!(null)))
            .await
            .unwrap();

        assert!(store.get("old").await.is_none());
        assert!(store.get("stuck").await.is_some());
        assert!(store.get("new").await.is_some());
    }

    #[tokio::test]
    async fn test_record_delivery_and_pending() {
        let dir = TempDir::new().unwrap();
        let store = ReceiptStore::open(dir.path().join("r.json"), week()).await;
        store
            .put(Receipt::new("a", CommandOutcome::Result, json!("x")))
            .await
            .unwrap();
        store
            .put(Receipt::new("b", CommandOutcome::Failed, json!("y")))
            .await
            .unwrap();

        let updated = store.mark_reported("a", 2).await.unwrap().unwrap();
        assert_eq!(updated.report_attempts, 2);
        assert_eq!(updated.delivery, ReceiptDelivery::Reported);

        let pending: Vec<String> = store.pending().await.into_iter().map(|r| r.command_id).collect();
        assert_eq!(pending, vec!["b".to_string()]);

        let orphaned = store.mark_orphaned("b", 5).await.unwrap().unwrap();
        assert_eq!(orphaned.delivery, ReceiptDelivery::Orphaned);
        assert!(store.pending().await.is_empty());

        assert!(store.mark_orphaned("missing", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_ledger_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("receipts.json");
        std::fs::write(&path, "[[[").unwrap();

        let store = ReceiptStore::open(&path, week()).await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_reopened_receipt_reports_identical_float_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("receipts.json");
        let values = [0.40000018174517804_f64, 0.1 + 0.2, 1e-300, 123456.78901234567, -2.5e17];

        let store = ReceiptStore::open(&path, week()).await;
        let mut first = Vec::new();
        for (n, v) in values.iter().enumerate() {
            let receipt = store
                .put(Receipt::new(format!("c{n}"), CommandOutcome::Result, json!({ "v": v })))
                .await
                .unwrap();
            first.push(serde_json::to_vec(&receipt.report()).unwrap());
        }

        let reopened = ReceiptStore::open(&path, week()).await;
        for (n, expected) in first.iter().enumerate() {
            let receipt = reopened.get(&format!("c{n}")).await.unwrap();
            assert_eq!(&serde_json::to_vec(&receipt.report()).unwrap(), expected);
        }
    }
}
