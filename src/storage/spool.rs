use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::warn;

use super::document::JsonDocument;
use crate::error::AppResult;
use crate::models::{SpooledEvent, TelemetryEvent};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpoolState {
    next_sequence: u64,
    #[serde(default)]
    dropped: u64,
    #[serde(default)]
    events: VecDeque<SpooledEvent>,
}

impl Default for SpoolState {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            dropped: 0,
            events: VecDeque::new(),
        }
    }
}

/// Disk-backed bounded FIFO of telemetry events.
///
/// Sequence ids are strictly increasing and never reused, including across
/// restarts. The front of `events` is the head to deliver next.
#[derive(Debug)]
pub struct TelemetrySpool {
    doc: JsonDocument<SpoolState>,
    capacity: usize,
}

impl TelemetrySpool {
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let spool = Self {
            doc: JsonDocument::open(path).await,
            capacity,
        };
        // A lowered capacity takes effect on the next append.
        let depth = spool.len().await;
        if depth > capacity {
            warn!(depth, capacity, "telemetry spool holds more events than its capacity");
        }
        spool
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `event`, evicting the oldest entries when full.
    pub async fn append(&self, event: TelemetryEvent) -> AppResult<SpooledEvent> {
        let capacity = self.capacity;
        self.doc
            .update(move |state| {
                let entry = SpooledEvent {
                    sequence_id: state.next_sequence,
                    payload: event,
                    captured_at: Utc::now(),
                };
                state.next_sequence += 1;
                state.events.push_back(entry.clone());

                while state.events.len() > capacity {
                    if let Some(evicted) = state.events.pop_front() {
                        state.dropped += 1;
                        warn!(
                            sequence_id = evicted.sequence_id,
                            kind = evicted.payload.kind(),
                            dropped = state.dropped,
                            "telemetry spool full, dropped oldest event"
                        );
                    }
                }
                entry
            })
            .await
    }

    pub async fn head(&self) -> Option<SpooledEvent> {
        self.doc.read(|s| s.events.front().cloned()).await
    }

    /// Dequeue the head if it is still `sequence_id`.
    ///
    /// Returns false when the head has moved on (evicted during delivery).
    pub async fn ack(&self, sequence_id: u64) -> AppResult<bool> {
        let is_head = self
            .doc
            .read(|s| s.events.front().map(|e| e.sequence_id) == Some(sequence_id))
            .await;
        if !is_head {
            return Ok(false);
        }

        self.doc
            .update(move |state| {
                if state.events.front().map(|e| e.sequence_id) == Some(sequence_id) {
                    state.events.pop_front();
                    true
                } else {
                    false
                }
            })
            .await
    }

    pub async fn len(&self) -> usize {
        self.doc.read(|s| s.events.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dropped(&self) -> u64 {
        self.doc.read(|s| s.dropped).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(n: u64) -> TelemetryEvent {
        TelemetryEvent::lifecycle("command.completed", json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_fifo_order_and_ack() {
        let dir = TempDir::new().unwrap();
        let spool = TelemetrySpool::open(dir.path().join("spool.json"), 10).await;

        let first = spool.append(event(1)).await.unwrap();
        let second = spool.append(event(2)).await.unwrap();
        assert!(second.sequence_id > first.sequence_id);

        assert_eq!(spool.head().await.unwrap().sequence_id, first.sequence_id);
        assert!(!spool.ack(second.sequence_id).await.unwrap());
        assert_eq!(spool.len().await, 2);

        assert!(spool.ack(first.sequence_id).await.unwrap());
        assert_eq!(spool.head().await.unwrap().sequence_id, second.sequence_id);
    }

    #[tokio::test]
    async fn test_overflow_keeps_capacity_and_counts_drops() {
        let dir = TempDir::new().unwrap();
        let spool = TelemetrySpool::open(dir.path().join("spool.json"), 5).await;

        for n in 0..8 {
            spool.append(event(n)).await.unwrap();
        }

        assert_eq!(spool.len().await, 5);
        assert_eq!(spool.dropped().await, 3);
        let head = spool.head().await.unwrap();
        assert_eq!(head.payload, event(3));
    }

    #[tokio::test]
    async fn test_sequence_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.json");

        let spool = TelemetrySpool::open(&path, 10).await;
        let first = spool.append(event(1)).await.unwrap();
        spool.ack(first.sequence_id).await.unwrap();
        drop(spool);

        let reopened = TelemetrySpool::open(&path, 10).await;
        assert!(reopened.is_empty().await);
        let next = reopened.append(event(2)).await.unwrap();
        assert_eq!(next.sequence_id, first.sequence_id + 1);
    }
}
