//! Per-version change history.
//!
//! The recorder subscribes to the notifier's accepted-operation stream and
//! turns each operation into a [`ChangeRecord`]: who changed which ranges
//! at which version. Records are written once per (document, version) and
//! re-published on an external change feed.
//!
//! Offsets are in the coordinates of the document *before* the operation
//! (the version it was applied to).
//!
//! History is best-effort: it never blocks or fails an accepted
//! operation. If ranges cannot be derived a placeholder record with no
//! ranges is stored so the version is still accounted for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scribe_ot::{Component, ContentHash, OtError, TextOp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::AcceptedOperation;
use crate::storage::LogError;
use crate::DocumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRange {
    pub kind: ChangeKind,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub document_id: DocumentId,
    pub version: u64,
    pub author_id: String,
    pub client_op_id: Uuid,
    pub timestamp: u64,
    pub content_hash: ContentHash,
    pub ranges: Vec<ChangeRange>,
    /// Ranges could not be derived; `ranges` is empty.
    pub placeholder: bool,
}

impl ChangeRecord {
    pub fn from_accepted(op: &AcceptedOperation) -> Result<Self, OtError> {
        Ok(Self {
            ranges: derive_ranges(&op.operation.ops)?,
            ..Self::placeholder(op)
        })
    }

    pub fn placeholder(op: &AcceptedOperation) -> Self {
        Self {
            document_id: op.document_id,
            version: op.version,
            author_id: op.operation.author_id.clone(),
            client_op_id: op.operation.client_op_id,
            timestamp: op.operation.timestamp,
            content_hash: op.content_hash,
            ranges: Vec::new(),
            placeholder: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        Ok(record)
    }
}

/// Inserted and deleted ranges of `ops`, in base-document coordinates.
pub fn derive_ranges(ops: &TextOp) -> Result<Vec<ChangeRange>, OtError> {
    let mut ranges = Vec::new();
    let mut offset = 0usize;
    for component in ops.components() {
        if component.is_empty() {
            return Err(OtError::MalformedOperation {
                expected: ops.base_len(),
                actual: offset,
            });
        }
        match component {
            Component::Retain(n) => offset += n,
            Component::Insert(text) => ranges.push(ChangeRange {
                kind: ChangeKind::Insert,
                offset,
                length: text.chars().count(),
            }),
            Component::Delete(n) => {
                ranges.push(ChangeRange {
                    kind: ChangeKind::Delete,
                    offset,
                    length: *n,
                });
                offset += n;
            }
        }
    }
    Ok(ranges)
}

/// Durable store for change records.
pub trait HistoryStore: Send + Sync {
    /// Write `record` unless one already exists for its version.
    /// Returns `false` for the duplicate case.
    fn put_change(&self, doc: DocumentId, record: &ChangeRecord) -> Result<bool, LogError>;

    /// Records with `version > after_version`, ascending.
    fn changes_since(&self, doc: DocumentId, after_version: u64)
        -> Result<Vec<ChangeRecord>, LogError>;
}

#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub recorded: u64,
    pub duplicates: u64,
    pub placeholders: u64,
    pub store_failures: u64,
    pub lagged: u64,
}

pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    feed: broadcast::Sender<ChangeRecord>,
    recorded: AtomicU64,
    duplicates: AtomicU64,
    placeholders: AtomicU64,
    store_failures: AtomicU64,
    lagged: AtomicU64,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            store,
            feed,
            recorded: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            placeholders: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
        }
    }

    /// External change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.feed.subscribe()
    }

    /// Record one accepted operation. Returns `None` if this version was
    /// already recorded.
    pub fn record(&self, op: &AcceptedOperation) -> Option<ChangeRecord> {
        let record = match ChangeRecord::from_accepted(op) {
            Ok(record) => record,
            Err(e) => {
                log::warn!(
                    "Could not derive ranges for {} v{}: {}",
                    op.document_id,
                    op.version,
                    e
                );
                self.placeholders.fetch_add(1, Ordering::Relaxed);
                ChangeRecord::placeholder(op)
            }
        };

        match self.store.put_change(op.document_id, &record) {
            Ok(true) => {}
            Ok(false) => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                // Keep the feed flowing even if the durable copy is lost.
                log::error!(
                    "Failed to store history for {} v{}: {}",
                    op.document_id,
                    op.version,
                    e
                );
                self.store_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.recorded.fetch_add(1, Ordering::Relaxed);
        let _ = self.feed.send(record.clone());
        Some(record)
    }

    /// Consume `rx` until the stream closes. Store writes run on the
    /// blocking pool, one at a time and in stream order.
    pub fn spawn(self: Arc<Self>, mut rx: broadcast::Receiver<Arc<AcceptedOperation>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(op) => {
                        let recorder = Arc::clone(&self);
                        let written = tokio::task::spawn_blocking(move || {
                            recorder.record(&op);
                        })
                        .await;
                        if let Err(e) = written {
                            log::error!("History write task failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("History recorder lagged, {n} operations not recorded");
                        self.lagged.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::debug!("History recorder stopped");
        })
    }

    pub fn changes_since(
        &self,
        doc: DocumentId,
        after_version: u64,
    ) -> Result<Vec<ChangeRecord>, LogError> {
        self.store.changes_since(doc, after_version)
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryHistory;
    use scribe_ot::Operation;

    fn accepted(version: u64, ops: TextOp) -> AcceptedOperation {
        AcceptedOperation {
            document_id: Uuid::nil(),
            version,
            operation: Operation::new(version - 1, "alice", ops),
            content_hash: ContentHash::of(""),
        }
    }

    #[test]
    fn test_ranges_use_base_coordinates() {
        // "hello world" -> "hi world!"
        let mut ops = TextOp::new();
        ops.retain(1).delete(4).insert("i").retain(6).insert("!");
        let ranges = derive_ranges(&ops).unwrap();
        assert_eq!(
            ranges,
            vec![
                ChangeRange { kind: ChangeKind::Insert, offset: 1, length: 1 },
                ChangeRange { kind: ChangeKind::Delete, offset: 1, length: 4 },
                ChangeRange { kind: ChangeKind::Insert, offset: 11, length: 1 },
            ]
        );
    }

    #[test]
    fn test_malformed_op_yields_placeholder() {
        let recorder = HistoryRecorder::new(Arc::new(MemoryHistory::new()), 8);
        let ops = TextOp::from_components(vec![Component::Retain(0), Component::Insert("x".into())]);
        let record = recorder.record(&accepted(1, ops)).unwrap();
        assert!(record.placeholder);
        assert!(record.ranges.is_empty());
        assert_eq!(record.version, 1);
        assert_eq!(recorder.stats().placeholders, 1);
    }

    #[test]
    fn test_record_is_idempotent() {
        let store = Arc::new(MemoryHistory::new());
        let recorder = HistoryRecorder::new(store.clone(), 8);
        let mut ops = TextOp::new();
        ops.insert("x");
        let op = accepted(1, ops);

        assert!(recorder.record(&op).is_some());
        assert!(recorder.record(&op).is_none());
        assert_eq!(recorder.changes_since(Uuid::nil(), 0).unwrap().len(), 1);
        assert_eq!(recorder.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_spawned_recorder_feeds_subscribers() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(HistoryRecorder::new(Arc::new(MemoryHistory::new()), 16));
        let mut feed = recorder.subscribe();
        let handle = recorder.clone().spawn(rx);

        let mut ops = TextOp::new();
        ops.insert("abc");
        tx.send(Arc::new(accepted(1, ops))).unwrap();

        let record = feed.recv().await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.ranges[0].length, 3);

        drop(tx);
        handle.await.unwrap();
        assert_eq!(recorder.changes_since(Uuid::nil(), 0).unwrap().len(), 1);
    }

    /// Delays every write, like a store stuck on disk.
    struct SlowHistory {
        inner: MemoryHistory,
        delay: std::time::Duration,
    }

    impl HistoryStore for SlowHistory {
        fn put_change(&self, doc: DocumentId, record: &ChangeRecord) -> Result<bool, LogError> {
            std::thread::sleep(self.delay);
            self.inner.put_change(doc, record)
        }

        fn changes_since(
            &self,
            doc: DocumentId,
            after_version: u64,
        ) -> Result<Vec<ChangeRecord>, LogError> {
            self.inner.changes_since(doc, after_version)
        }
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_the_runtime() {
        let store = Arc::new(SlowHistory {
            inner: MemoryHistory::new(),
            delay: std::time::Duration::from_millis(300),
        });
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(HistoryRecorder::new(store, 16));
        let mut feed = recorder.subscribe();
        let handle = recorder.clone().spawn(rx);

        for version in 1..=2 {
            let mut ops = TextOp::new();
            ops.insert("x");
            tx.send(Arc::new(accepted(version, ops))).unwrap();
        }

        // Timers keep firing while the first write sleeps.
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        assert_eq!(feed.recv().await.unwrap().version, 1);
        assert_eq!(feed.recv().await.unwrap().version, 2);
        drop(tx);
        handle.await.unwrap();
    }
}
