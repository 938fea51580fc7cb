//! RocksDB-backed operation log and history store.
//!
//! Column families:
//! - `snapshots`: document content at a version (bincode, LZ4 compressed)
//! - `entries`: operation log entries (bincode)
//! - `metadata`: per-document head, snapshot version and sizes (bincode)
//! - `history`: change records written by the history recorder (bincode)
//!
//! Versioned keys are `<doc_id:16 bytes><version:8 bytes big-endian>`, so a
//! forward scan from `(doc, v)` walks one document in version order.
//!
//! An append writes the entry and the advanced head in one `WriteBatch`;
//! either both are durable or neither is.
//!
//! Performance targets:
//! - Open (10k docs): <100ms (bloom filters + block cache)
//! - Append (single-char edit): <50μs
//! - Snapshot load (1MB, cache hit): <1ms

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::history::{ChangeRecord, HistoryStore};
use crate::storage::log::{LogEntry, LogError, OperationLog, Snapshot};
use crate::DocumentId;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_ENTRIES: &str = "entries";
const CF_METADATA: &str = "metadata";
const CF_HISTORY: &str = "history";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_ENTRIES, CF_METADATA, CF_HISTORY];

/// Unheld document locks are pruned once the table grows past this.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch. Off by default; the RocksDB WAL still
    /// protects against process crashes.
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }

    /// Production defaults rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Per-document bookkeeping kept next to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Highest durable version.
    pub head_version: u64,
    /// Version of the newest snapshot, if any.
    pub snapshot_version: Option<u64>,
    /// Entries currently stored (after compaction).
    pub entry_count: u64,
    /// Uncompressed size of the newest snapshot.
    pub snapshot_size: u64,
    /// Compressed size of the newest snapshot.
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            head_version: 0,
            snapshot_version: None,
            entry_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }

    fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn backend(e: rocksdb::Error) -> LogError {
    LogError::Backend(e.to_string())
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Per-document locks serializing read-check-write of metadata.
    doc_locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, LogError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(backend)?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            doc_locks: Mutex::new(HashMap::new()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Already LZ4 compressed by us.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_ENTRIES => {
                // Many small sequential writes, range-scanned by document.
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_HISTORY => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc: DocumentId) -> Result<Option<DocumentMetadata>, LogError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc.as_bytes()).map_err(backend)? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), LogError> {
        self.db.flush().map_err(backend)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LogError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LogError::Backend(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), LogError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(backend)
    }

    /// The write lock for one document. Writers to other documents never
    /// wait on it.
    fn doc_lock(&self, doc: DocumentId) -> Result<Arc<Mutex<()>>, LogError> {
        let mut locks = self
            .doc_locks
            .lock()
            .map_err(|_| LogError::Backend("document lock table poisoned".into()))?;
        if locks.len() >= LOCK_TABLE_PRUNE_AT && !locks.contains_key(&doc) {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Ok(Arc::clone(locks.entry(doc).or_default()))
    }

    /// `doc_id` (16 bytes) + `version` (8 bytes big-endian).
    fn version_key(doc: DocumentId, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn key_version(doc: DocumentId, key: &[u8]) -> Option<u64> {
        if key.len() != 24 || &key[..16] != doc.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        Some(u64::from_be_bytes(buf))
    }

    /// Scan one document's versioned keys in `[from, to]`, at most `limit`.
    fn scan(
        &self,
        cf_name: &str,
        doc: DocumentId,
        from: u64,
        to: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Box<[u8]>)>, LogError> {
        let cf = self.cf(cf_name)?;
        let start_key = Self::version_key(doc, from);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(backend)?;
            match Self::key_version(doc, &key) {
                Some(v) if v <= to => out.push((v, value)),
                _ => break,
            }
        }
        Ok(out)
    }

    fn decode_snapshot(compressed: &[u8]) -> Result<Snapshot, LogError> {
        let bytes = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| LogError::Compression(e.to_string()))?;
        Snapshot::decode(&bytes)
    }
}

impl OperationLog for DocumentStore {
    fn append(&self, doc: DocumentId, entry: &LogEntry) -> Result<(), LogError> {
        let lock = self.doc_lock(doc)?;
        let _guard = hold(&lock)?;

        let mut meta = self
            .load_metadata(doc)?
            .unwrap_or_else(|| DocumentMetadata::new(doc));
        let expected = meta.head_version + 1;
        if entry.version != expected {
            return Err(LogError::VersionConflict {
                expected,
                got: entry.version,
            });
        }
        meta.head_version = entry.version;
        meta.entry_count += 1;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_ENTRIES)?,
            Self::version_key(doc, entry.version),
            entry.encode()?,
        );
        batch.put_cf(self.cf(CF_METADATA)?, doc.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn head_version(&self, doc: DocumentId) -> Result<Option<u64>, LogError> {
        Ok(self.load_metadata(doc)?.map(|m| m.head_version))
    }

    fn read_page(
        &self,
        doc: DocumentId,
        from: u64,
        to: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.scan(CF_ENTRIES, doc, from, to, limit)?
            .into_iter()
            .map(|(_, bytes)| LogEntry::decode(&bytes))
            .collect()
    }

    fn save_snapshot(&self, doc: DocumentId, snapshot: &Snapshot) -> Result<(), LogError> {
        let lock = self.doc_lock(doc)?;
        let _guard = hold(&lock)?;

        let mut meta = self
            .load_metadata(doc)?
            .unwrap_or_else(|| DocumentMetadata::new(doc));
        if snapshot.version > meta.head_version {
            return Err(LogError::VersionConflict {
                expected: meta.head_version,
                got: snapshot.version,
            });
        }

        let encoded = snapshot.encode()?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        if meta.snapshot_version.map_or(true, |v| snapshot.version >= v) {
            meta.snapshot_version = Some(snapshot.version);
            meta.snapshot_size = encoded.len() as u64;
            meta.compressed_size = compressed.len() as u64;
        }
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_SNAPSHOTS)?,
            Self::version_key(doc, snapshot.version),
            &compressed,
        );
        batch.put_cf(self.cf(CF_METADATA)?, doc.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn latest_snapshot(&self, doc: DocumentId) -> Result<Option<Snapshot>, LogError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let end_key = Self::version_key(doc, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&end_key, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item.map_err(backend)?;
                if Self::key_version(doc, &key).is_none() {
                    return Ok(None);
                }
                Self::decode_snapshot(&value).map(Some)
            }
            None => Ok(None),
        }
    }

    fn compact(&self, doc: DocumentId, up_to: u64) -> Result<u64, LogError> {
        let lock = self.doc_lock(doc)?;
        let _guard = hold(&lock)?;

        let Some(mut meta) = self.load_metadata(doc)? else {
            return Ok(0);
        };

        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();

        let entries = self.scan(CF_ENTRIES, doc, 0, up_to, usize::MAX)?;
        for (version, _) in &entries {
            batch.delete_cf(cf_entries, Self::version_key(doc, *version));
        }

        // Keep the newest snapshot at or below `up_to`; drop everything older.
        let snapshots = self.scan(CF_SNAPSHOTS, doc, 0, up_to, usize::MAX)?;
        if let Some((floor, _)) = snapshots.last() {
            for (version, _) in &snapshots {
                if version < floor {
                    batch.delete_cf(cf_snapshots, Self::version_key(doc, *version));
                }
            }
        }

        let removed = entries.len() as u64;
        meta.entry_count = meta.entry_count.saturating_sub(removed);
        meta.touch();
        batch.put_cf(self.cf(CF_METADATA)?, doc.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!("Compacted {removed} entries of {doc} up to v{up_to}");
        Ok(removed)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, LogError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(backend)?;
            if let Ok(bytes) = <[u8; 16]>::try_from(key.as_ref()) {
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }

        Ok(doc_ids)
    }

    fn delete_document(&self, doc: DocumentId) -> Result<(), LogError> {
        let lock = self.doc_lock(doc)?;
        let _guard = hold(&lock)?;

        let mut batch = WriteBatch::default();
        for cf_name in [CF_SNAPSHOTS, CF_ENTRIES, CF_HISTORY] {
            let cf = self.cf(cf_name)?;
            for (version, _) in self.scan(cf_name, doc, 0, u64::MAX, usize::MAX)? {
                batch.delete_cf(cf, Self::version_key(doc, version));
            }
        }
        batch.delete_cf(self.cf(CF_METADATA)?, doc.as_bytes());

        self.write(batch)
    }
}

impl HistoryStore for DocumentStore {
    fn put_change(&self, doc: DocumentId, record: &ChangeRecord) -> Result<bool, LogError> {
        let lock = self.doc_lock(doc)?;
        let _guard = hold(&lock)?;

        let cf = self.cf(CF_HISTORY)?;
        let key = Self::version_key(doc, record.version);
        if self.db.get_cf(cf, &key).map_err(backend)?.is_some() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, record.encode()?);
        self.write(batch)?;
        Ok(true)
    }

    fn changes_since(
        &self,
        doc: DocumentId,
        after_version: u64,
    ) -> Result<Vec<ChangeRecord>, LogError> {
        let Some(from) = after_version.checked_add(1) else {
            return Ok(Vec::new());
        };
        self.scan(CF_HISTORY, doc, from, u64::MAX, usize::MAX)?
            .into_iter()
            .map(|(_, bytes)| ChangeRecord::decode(&bytes))
            .collect()
    }
}

fn hold(lock: &Mutex<()>) -> Result<MutexGuard<'_, ()>, LogError> {
    lock.lock()
        .map_err(|_| LogError::Backend("document write lock poisoned".into()))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_ot::{ContentHash, Operation};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    /// Entry `version` of a document that grows by one 'x' per version.
    fn entry(version: u64) -> LogEntry {
        let op = Operation::insert_at(version - 1, "alice", (version - 1) as usize, 0, "x");
        LogEntry {
            version,
            operation: op,
            content_hash: ContentHash::of(&"x".repeat(version as usize)),
        }
    }

    fn record(doc: DocumentId, version: u64) -> ChangeRecord {
        ChangeRecord {
            document_id: doc,
            version,
            author_id: "alice".into(),
            client_op_id: Uuid::new_v4(),
            timestamp: 0,
            content_hash: ContentHash::of(""),
            ranges: Vec::new(),
            placeholder: false,
        }
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_read() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        for v in 1..=10 {
            store.append(doc, &entry(v)).unwrap();
        }

        assert_eq!(store.head_version(doc).unwrap(), Some(10));
        let page = store.read_page(doc, 4, 10, 3).unwrap();
        assert_eq!(page.iter().map(|e| e.version).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(page[0], entry(4));
        assert_eq!(store.read_page(doc, 9, 20, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        store.append(doc, &entry(1)).unwrap();

        assert_eq!(
            store.append(doc, &entry(1)),
            Err(LogError::VersionConflict { expected: 2, got: 1 })
        );
        assert_eq!(
            store.append(doc, &entry(3)),
            Err(LogError::VersionConflict { expected: 2, got: 3 })
        );
        assert_eq!(store.head_version(doc).unwrap(), Some(1));
    }

    #[test]
    fn test_unknown_document_has_no_state() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        assert_eq!(store.head_version(doc).unwrap(), None);
        assert_eq!(store.latest_snapshot(doc).unwrap(), None);
        assert!(store.read_page(doc, 1, 10, 10).unwrap().is_empty());
    }

    #[test]
    fn test_latest_snapshot_wins() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        store.save_snapshot(doc, &Snapshot::new(0, "")).unwrap();
        for v in 1..=5 {
            store.append(doc, &entry(v)).unwrap();
        }
        store.save_snapshot(doc, &Snapshot::new(3, "xxx")).unwrap();
        store.save_snapshot(doc, &Snapshot::new(5, "xxxxx")).unwrap();

        let snap = store.latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(snap.version, 5);
        assert_eq!(snap.content, "xxxxx");
        assert!(snap.is_intact());

        let meta = store.load_metadata(doc).unwrap().unwrap();
        assert_eq!(meta.snapshot_version, Some(5));
        assert_eq!(meta.head_version, 5);
    }

    #[test]
    fn test_snapshot_beyond_head_rejected() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        assert!(matches!(
            store.save_snapshot(doc, &Snapshot::new(2, "zz")),
            Err(LogError::VersionConflict { expected: 0, got: 2 })
        ));
    }

    #[test]
    fn test_snapshot_does_not_leak_across_documents() {
        let (_dir, store) = open_temp();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        store.save_snapshot(a, &Snapshot::new(0, "doc a")).unwrap();

        // `b` sorts after `a`; a reverse seek from b's range must not find a's snapshot.
        assert_eq!(store.latest_snapshot(b).unwrap(), None);
        assert_eq!(store.latest_snapshot(a).unwrap().unwrap().content, "doc a");
    }

    #[test]
    fn test_compact() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        for v in 1..=20 {
            store.append(doc, &entry(v)).unwrap();
        }
        store.save_snapshot(doc, &Snapshot::new(10, "x".repeat(10))).unwrap();
        store.save_snapshot(doc, &Snapshot::new(15, "x".repeat(15))).unwrap();

        let removed = store.compact(doc, 12).unwrap();
        assert_eq!(removed, 12);

        let remaining = store.read_page(doc, 0, u64::MAX, usize::MAX).unwrap();
        assert_eq!(remaining.len(), 8);
        assert_eq!(remaining[0].version, 13);
        assert_eq!(store.latest_snapshot(doc).unwrap().unwrap().version, 15);
        assert_eq!(store.load_metadata(doc).unwrap().unwrap().entry_count, 8);
    }

    #[test]
    fn test_list_and_delete_documents() {
        let (_dir, store) = open_temp();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.save_snapshot(*id, &Snapshot::empty()).unwrap();
            store.append(*id, &entry(1)).unwrap();
        }
        store.put_change(ids[0], &record(ids[0], 1)).unwrap();

        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 5);
        for id in &ids {
            assert!(listed.contains(id));
        }

        store.delete_document(ids[0]).unwrap();
        assert_eq!(store.head_version(ids[0]).unwrap(), None);
        assert_eq!(store.latest_snapshot(ids[0]).unwrap(), None);
        assert!(store.changes_since(ids[0], 0).unwrap().is_empty());
        assert_eq!(store.list_documents().unwrap().len(), 4);
        assert_eq!(store.head_version(ids[1]).unwrap(), Some(1));
    }

    #[test]
    fn test_documents_do_not_share_a_write_lock() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);
        let (busy, other) = (Uuid::new_v4(), Uuid::new_v4());

        let lock = store.doc_lock(busy).unwrap();
        let _held = hold(&lock).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let writer = Arc::clone(&store);
        std::thread::spawn(move || {
            let _ = tx.send(writer.append(other, &entry(1)));
        });
        let appended = rx.recv_timeout(std::time::Duration::from_secs(5));
        assert!(matches!(appended, Ok(Ok(()))), "{appended:?}");
        assert_eq!(store.head_version(other).unwrap(), Some(1));

        // The same document does wait.
        assert!(Arc::ptr_eq(&lock, &store.doc_lock(busy).unwrap()));
        assert!(lock.try_lock().is_err());
    }

    #[test]
    fn test_lock_table_prunes_unheld_locks() {
        let (_dir, store) = open_temp();
        let kept = Uuid::new_v4();
        let held = store.doc_lock(kept).unwrap();
        for _ in 0..LOCK_TABLE_PRUNE_AT + 10 {
            store.doc_lock(Uuid::new_v4()).unwrap();
        }

        let locks = store.doc_locks.lock().unwrap();
        assert!(locks.len() <= LOCK_TABLE_PRUNE_AT);
        assert!(Arc::ptr_eq(&held, &locks[&kept]));
    }

    #[test]
    fn test_history_write_once() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        assert!(store.put_change(doc, &record(doc, 1)).unwrap());
        assert!(!store.put_change(doc, &record(doc, 1)).unwrap());
        assert!(store.put_change(doc, &record(doc, 2)).unwrap());

        let since = store.changes_since(doc, 1).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].version, 2);
        assert!(store.changes_since(doc, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_log() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(doc, &Snapshot::empty()).unwrap();
            for v in 1..=3 {
                store.append(doc, &entry(v)).unwrap();
            }
            store.sync().unwrap();
        }

        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.head_version(doc).unwrap(), Some(3));
        assert_eq!(store.read_page(doc, 1, 3, 10).unwrap().len(), 3);
        store.append(doc, &entry(4)).unwrap();
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let content = "lorem ipsum dolor sit amet ".repeat(40_000);
        store.save_snapshot(doc, &Snapshot::new(0, content.clone())).unwrap();

        let meta = store.load_metadata(doc).unwrap().unwrap();
        assert!(meta.snapshot_size > 1_000_000);
        assert!(
            meta.compressed_size < meta.snapshot_size / 10,
            "repetitive text should compress >10x: {} -> {}",
            meta.snapshot_size,
            meta.compressed_size
        );
        assert_eq!(store.latest_snapshot(doc).unwrap().unwrap().content, content);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(StoreConfig::at("/tmp/x").path, PathBuf::from("/tmp/x"));
    }
}
