//! In-memory backends.
//!
//! Same contract as the RocksDB store, nothing survives the process.
//! `MemoryLog` also exposes fault injection hooks (dropped entries, failing
//! reads, slow appends) so recovery paths can be driven deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::history::{ChangeRecord, HistoryStore};
use crate::storage::log::{LogEntry, LogError, OperationLog, Snapshot};
use crate::DocumentId;

#[derive(Debug, Default)]
struct DocLog {
    head: u64,
    entries: BTreeMap<u64, LogEntry>,
    snapshots: BTreeMap<u64, Snapshot>,
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    docs: Mutex<HashMap<DocumentId, DocLog>>,
    fail_reads: AtomicBool,
    append_delay_ms: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a single entry without touching the head, leaving a hole.
    pub fn remove_entry(&self, doc: DocumentId, version: u64) -> bool {
        match self.docs.lock() {
            Ok(mut docs) => docs
                .get_mut(&doc)
                .and_then(|d| d.entries.remove(&version))
                .is_some(),
            Err(_) => false,
        }
    }

    /// Make every read return a backend error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every append.
    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn entry_count(&self, doc: DocumentId) -> usize {
        self.docs
            .lock()
            .map(|docs| docs.get(&doc).map_or(0, |d| d.entries.len()))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<DocumentId, DocLog>>, LogError> {
        self.docs
            .lock()
            .map_err(|_| LogError::Backend("memory log lock poisoned".into()))
    }

    fn check_reads(&self) -> Result<(), LogError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LogError::Backend("injected read failure".into()));
        }
        Ok(())
    }
}

impl OperationLog for MemoryLog {
    fn append(&self, doc: DocumentId, entry: &LogEntry) -> Result<(), LogError> {
        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        let mut docs = self.lock()?;
        let log = docs.entry(doc).or_default();
        let expected = log.head + 1;
        if entry.version != expected {
            return Err(LogError::VersionConflict {
                expected,
                got: entry.version,
            });
        }
        log.entries.insert(entry.version, entry.clone());
        log.head = entry.version;
        Ok(())
    }

    fn head_version(&self, doc: DocumentId) -> Result<Option<u64>, LogError> {
        self.check_reads()?;
        Ok(self.lock()?.get(&doc).map(|d| d.head))
    }

    fn read_page(
        &self,
        doc: DocumentId,
        from: u64,
        to: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.check_reads()?;
        if from > to {
            return Ok(Vec::new());
        }
        let docs = self.lock()?;
        Ok(docs
            .get(&doc)
            .map(|d| {
                d.entries
                    .range(from..=to)
                    .take(limit)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn save_snapshot(&self, doc: DocumentId, snapshot: &Snapshot) -> Result<(), LogError> {
        let mut docs = self.lock()?;
        let log = docs.entry(doc).or_default();
        if snapshot.version > log.head {
            return Err(LogError::VersionConflict {
                expected: log.head,
                got: snapshot.version,
            });
        }
        log.snapshots.insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    fn latest_snapshot(&self, doc: DocumentId) -> Result<Option<Snapshot>, LogError> {
        self.check_reads()?;
        let docs = self.lock()?;
        Ok(docs
            .get(&doc)
            .and_then(|d| d.snapshots.values().next_back().cloned()))
    }

    fn compact(&self, doc: DocumentId, up_to: u64) -> Result<u64, LogError> {
        let mut docs = self.lock()?;
        let Some(log) = docs.get_mut(&doc) else {
            return Ok(0);
        };
        let keep = log.entries.split_off(&(up_to + 1));
        let removed = log.entries.len() as u64;
        log.entries = keep;

        let floor = log.snapshots.range(..=up_to).next_back().map(|(v, _)| *v);
        if let Some(floor) = floor {
            log.snapshots = log.snapshots.split_off(&floor);
        }
        Ok(removed)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, LogError> {
        let mut ids: Vec<DocumentId> = self.lock()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete_document(&self, doc: DocumentId) -> Result<(), LogError> {
        self.lock()?.remove(&doc);
        Ok(())
    }
}

/// In-memory [`HistoryStore`].
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<HashMap<DocumentId, BTreeMap<u64, ChangeRecord>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistory {
    fn put_change(&self, doc: DocumentId, record: &ChangeRecord) -> Result<bool, LogError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| LogError::Backend("history lock poisoned".into()))?;
        let doc_records = records.entry(doc).or_default();
        if doc_records.contains_key(&record.version) {
            return Ok(false);
        }
        doc_records.insert(record.version, record.clone());
        Ok(true)
    }

    fn changes_since(
        &self,
        doc: DocumentId,
        after_version: u64,
    ) -> Result<Vec<ChangeRecord>, LogError> {
        let records = self
            .records
            .lock()
            .map_err(|_| LogError::Backend("history lock poisoned".into()))?;
        Ok(records
            .get(&doc)
            .map(|r| {
                r.range(after_version.saturating_add(1)..)
                    .map(|(_, c)| c.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_ot::{ContentHash, Operation};
    use uuid::Uuid;

    fn entry(version: u64) -> LogEntry {
        let op = Operation::insert_at(version - 1, "a", (version - 1) as usize, 0, "x");
        LogEntry {
            version,
            operation: op,
            content_hash: ContentHash::of(&"x".repeat(version as usize)),
        }
    }

    #[test]
    fn test_append_enforces_density() {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        assert_eq!(log.head_version(doc).unwrap(), None);

        log.append(doc, &entry(1)).unwrap();
        log.append(doc, &entry(2)).unwrap();
        assert_eq!(
            log.append(doc, &entry(2)),
            Err(LogError::VersionConflict { expected: 3, got: 2 })
        );
        assert_eq!(
            log.append(doc, &entry(5)),
            Err(LogError::VersionConflict { expected: 3, got: 5 })
        );
        assert_eq!(log.head_version(doc).unwrap(), Some(2));
    }

    #[test]
    fn test_snapshot_at_zero_creates_document() {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        log.save_snapshot(doc, &Snapshot::new(0, "seed")).unwrap();
        assert_eq!(log.head_version(doc).unwrap(), Some(0));
        assert_eq!(log.latest_snapshot(doc).unwrap().unwrap().content, "seed");
    }

    #[test]
    fn test_snapshot_beyond_head_rejected() {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        log.append(doc, &entry(1)).unwrap();
        assert!(log.save_snapshot(doc, &Snapshot::new(4, "x")).is_err());
    }

    #[test]
    fn test_compact() {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        for v in 1..=6 {
            log.append(doc, &entry(v)).unwrap();
        }
        log.save_snapshot(doc, &Snapshot::new(2, "xx")).unwrap();
        log.save_snapshot(doc, &Snapshot::new(4, "xxxx")).unwrap();

        assert_eq!(log.compact(doc, 4).unwrap(), 4);
        assert_eq!(log.entry_count(doc), 2);
        assert_eq!(log.read_page(doc, 1, 6, 10).unwrap()[0].version, 5);
        assert_eq!(log.latest_snapshot(doc).unwrap().unwrap().version, 4);
        assert_eq!(log.head_version(doc).unwrap(), Some(6));
    }

    #[test]
    fn test_fault_injection() {
        let log = MemoryLog::new();
        let doc = Uuid::new_v4();
        log.append(doc, &entry(1)).unwrap();

        log.set_fail_reads(true);
        assert!(matches!(log.head_version(doc), Err(LogError::Backend(_))));
        log.set_fail_reads(false);

        assert!(log.remove_entry(doc, 1));
        assert!(log.read_page(doc, 1, 1, 10).unwrap().is_empty());
        assert_eq!(log.head_version(doc).unwrap(), Some(1));
    }

    #[test]
    fn test_delete_and_list() {
        let log = MemoryLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        log.append(a, &entry(1)).unwrap();
        log.save_snapshot(b, &Snapshot::empty()).unwrap();
        assert_eq!(log.list_documents().unwrap().len(), 2);

        log.delete_document(a).unwrap();
        assert_eq!(log.list_documents().unwrap(), vec![b]);
        assert_eq!(log.head_version(a).unwrap(), None);
    }
}
