//! Durable operation log abstraction.
//!
//! Per document the log holds a dense sequence of entries `1..=head` plus
//! snapshots keyed by version. Entries at or below the latest snapshot may
//! be compacted away; entries above it never are.
//!
//! ```text
//!   v0 snapshot     entries                      head
//!   ───────────┬───┬───┬───┬───┬───┬───┬───┬───┐
//!              │ 1 │ 2 │ 3 │ 4 │ 5 │ 6 │ 7 │ 8 │
//!   ───────────┴───┴───┴───┴───┴───┴───┴───┴───┘
//!                          ▲ snapshot v4: entries 1..=4 compactable
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use scribe_ot::{ContentHash, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DocumentId;

/// Default number of entries fetched per backend round trip.
pub const DEFAULT_PAGE_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// The append was not at `head + 1`. Two writers, or a stale session.
    #[error("version conflict: expected {expected}, got {got}")]
    VersionConflict { expected: u64, got: u64 },

    /// A version inside a requested range is absent.
    #[error("missing log entry at version {missing}")]
    Gap { missing: u64 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

/// One accepted operation at its assigned version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: u64,
    /// The operation as applied, i.e. rebased onto `version - 1`.
    pub operation: Operation,
    /// Hash of the document content at `version`.
    pub content_hash: ContentHash,
}

impl LogEntry {
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        Ok(entry)
    }
}

/// Full document content at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub content: String,
    pub content_hash: ContentHash,
}

impl Snapshot {
    pub fn new(version: u64, content: impl Into<String>) -> Self {
        let content = content.into();
        let content_hash = ContentHash::of(&content);
        Self {
            version,
            content,
            content_hash,
        }
    }

    /// The implicit state of a document nobody has written to.
    pub fn empty() -> Self {
        Self::new(0, String::new())
    }

    pub fn is_intact(&self) -> bool {
        ContentHash::of(&self.content) == self.content_hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        Ok(snapshot)
    }
}

/// Durable, append-only, per-document operation log.
///
/// Implementations are synchronous; the engine calls them from blocking
/// tasks under a timeout.
pub trait OperationLog: Send + Sync {
    /// Append `entry` at exactly `head + 1` (1 for a document with no
    /// state). The entry and the new head are written atomically.
    fn append(&self, doc: DocumentId, entry: &LogEntry) -> Result<(), LogError>;

    /// Highest durable version, or `None` if the document has no state.
    /// A document with only a v0 snapshot reports `Some(0)`.
    fn head_version(&self, doc: DocumentId) -> Result<Option<u64>, LogError>;

    /// Up to `limit` entries with `from <= version <= to`, ascending.
    /// Missing versions are simply absent; gap detection is the caller's.
    fn read_page(
        &self,
        doc: DocumentId,
        from: u64,
        to: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, LogError>;

    /// Store a snapshot. Its version must not exceed the head.
    fn save_snapshot(&self, doc: DocumentId, snapshot: &Snapshot) -> Result<(), LogError>;

    fn latest_snapshot(&self, doc: DocumentId) -> Result<Option<Snapshot>, LogError>;

    /// Drop entries with `version <= up_to` and snapshots older than the
    /// latest one at or below `up_to`. Returns the number of entries removed.
    fn compact(&self, doc: DocumentId, up_to: u64) -> Result<u64, LogError>;

    fn list_documents(&self) -> Result<Vec<DocumentId>, LogError>;

    fn delete_document(&self, doc: DocumentId) -> Result<(), LogError>;
}

/// Lazy, paged, gap-checked walk over `from..=to`.
///
/// Yields `Err(Gap)` once and then stops if a version is missing. The
/// range can be restarted from its beginning at any point.
pub struct LogRange {
    log: Arc<dyn OperationLog>,
    doc: DocumentId,
    from: u64,
    to: u64,
    next: u64,
    page: VecDeque<LogEntry>,
    page_size: usize,
    done: bool,
}

impl LogRange {
    pub fn new(log: Arc<dyn OperationLog>, doc: DocumentId, from: u64, to: u64) -> Self {
        Self {
            log,
            doc,
            from,
            to,
            next: from,
            page: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            done: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn restart(&mut self) {
        self.next = self.from;
        self.page.clear();
        self.done = false;
    }

    /// Next version the iterator will yield.
    pub fn position(&self) -> u64 {
        self.next
    }

    fn fail(&mut self, err: LogError) -> Option<Result<LogEntry, LogError>> {
        self.done = true;
        self.page.clear();
        Some(Err(err))
    }
}

impl Iterator for LogRange {
    type Item = Result<LogEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next > self.to {
            return None;
        }

        if self.page.is_empty() {
            match self
                .log
                .read_page(self.doc, self.next, self.to, self.page_size)
            {
                Ok(entries) => self.page = entries.into(),
                Err(e) => return self.fail(e),
            }
        }

        match self.page.pop_front() {
            Some(entry) if entry.version == self.next => {
                self.next += 1;
                Some(Ok(entry))
            }
            _ => {
                let missing = self.next;
                self.fail(LogError::Gap { missing })
            }
        }
    }
}

/// Convenience wrapper over [`LogRange`].
pub fn read_range(log: &Arc<dyn OperationLog>, doc: DocumentId, from: u64, to: u64) -> LogRange {
    LogRange::new(Arc::clone(log), doc, from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;
    use scribe_ot::TextOp;
    use uuid::Uuid;

    fn entry(version: u64, doc_len: usize) -> LogEntry {
        let mut ops = TextOp::new();
        ops.retain(doc_len).insert("x");
        let op = Operation::new(version - 1, "tester", ops);
        LogEntry {
            version,
            operation: op,
            content_hash: ContentHash::of(&"x".repeat(doc_len + 1)),
        }
    }

    fn seeded(n: u64) -> (Arc<dyn OperationLog>, DocumentId) {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        for v in 1..=n {
            log.append(doc, &entry(v, (v - 1) as usize)).unwrap();
        }
        (Arc::new(log), doc)
    }

    #[test]
    fn test_range_pages_through_everything() {
        let (log, doc) = seeded(10);
        let versions: Vec<u64> = read_range(&log, doc, 1, 10)
            .with_page_size(3)
            .map(|e| e.unwrap().version)
            .collect();
        assert_eq!(versions, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_range() {
        let (log, doc) = seeded(3);
        assert_eq!(read_range(&log, doc, 4, 3).count(), 0);
    }

    #[test]
    fn test_range_reports_gap_and_stops() {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        for v in 1..=5 {
            log.append(doc, &entry(v, (v - 1) as usize)).unwrap();
        }
        log.remove_entry(doc, 3);
        let log: Arc<dyn OperationLog> = Arc::new(log);

        let items: Vec<_> = read_range(&log, doc, 1, 5).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert_eq!(items[2], Err(LogError::Gap { missing: 3 }));
    }

    #[test]
    fn test_range_beyond_head_is_a_gap() {
        let (log, doc) = seeded(2);
        let items: Vec<_> = read_range(&log, doc, 1, 4).collect();
        assert_eq!(items.last(), Some(&Err(LogError::Gap { missing: 3 })));
    }

    #[test]
    fn test_range_restart() {
        let (log, doc) = seeded(4);
        let mut range = read_range(&log, doc, 2, 4).with_page_size(2);
        assert_eq!(range.next().unwrap().unwrap().version, 2);
        assert_eq!(range.next().unwrap().unwrap().version, 3);
        assert_eq!(range.position(), 4);

        range.restart();
        let versions: Vec<u64> = range.map(|e| e.unwrap().version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[test]
    fn test_snapshot_integrity() {
        let mut snap = Snapshot::new(3, "abc");
        assert!(snap.is_intact());
        snap.content.push('!');
        assert!(!snap.is_intact());

        let decoded = Snapshot::decode(&Snapshot::new(1, "héllo").encode().unwrap()).unwrap();
        assert_eq!(decoded.content, "héllo");
    }
}
