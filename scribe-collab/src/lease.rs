//! Single-writer ownership of documents.
//!
//! A session must hold a valid lease on its document before every durable
//! append. Leases are fenced by an epoch: once a lease is revoked (or the
//! document is re-acquired elsewhere) the old holder's `is_valid` turns
//! false and its next append is refused.
//!
//! [`LocalLeaseManager`] covers a single process. A multi-node deployment
//! plugs a coordination-service backed [`LeaseProvider`] in its place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::DocumentId;

pub trait Lease: Send + Sync {
    fn document_id(&self) -> DocumentId;

    /// Fencing token; strictly increases across acquisitions.
    fn epoch(&self) -> u64;

    fn is_valid(&self) -> bool;
}

pub trait LeaseProvider: Send + Sync {
    /// Take exclusive ownership of `doc`. Fails while another holder's
    /// lease is still valid.
    fn acquire(&self, doc: DocumentId) -> Result<Box<dyn Lease>, EngineError>;
}

type LeaseTable = Arc<Mutex<HashMap<DocumentId, u64>>>;

/// In-process lease table.
#[derive(Default)]
pub struct LocalLeaseManager {
    table: LeaseTable,
    next_epoch: AtomicU64,
}

impl LocalLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate whatever lease is held on `doc`.
    pub fn revoke(&self, doc: DocumentId) -> bool {
        match self.table.lock() {
            Ok(mut table) => {
                let revoked = table.remove(&doc).is_some();
                if revoked {
                    log::warn!("Lease on {doc} revoked");
                }
                revoked
            }
            Err(_) => false,
        }
    }

    pub fn is_held(&self, doc: DocumentId) -> bool {
        self.table
            .lock()
            .map(|table| table.contains_key(&doc))
            .unwrap_or(false)
    }

    pub fn held_count(&self) -> usize {
        self.table.lock().map(|table| table.len()).unwrap_or(0)
    }
}

impl LeaseProvider for LocalLeaseManager {
    fn acquire(&self, doc: DocumentId) -> Result<Box<dyn Lease>, EngineError> {
        let mut table = self.table.lock().map_err(|_| EngineError::LoadFailure {
            document_id: doc,
            reason: "lease table poisoned".into(),
        })?;
        if table.contains_key(&doc) {
            return Err(EngineError::LoadFailure {
                document_id: doc,
                reason: "lease held by another session".into(),
            });
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        table.insert(doc, epoch);
        log::debug!("Lease on {doc} acquired (epoch {epoch})");

        Ok(Box::new(LocalLease {
            doc,
            epoch,
            table: Arc::clone(&self.table),
        }))
    }
}

struct LocalLease {
    doc: DocumentId,
    epoch: u64,
    table: LeaseTable,
}

impl Lease for LocalLease {
    fn document_id(&self) -> DocumentId {
        self.doc
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_valid(&self) -> bool {
        self.table
            .lock()
            .map(|table| table.get(&self.doc) == Some(&self.epoch))
            .unwrap_or(false)
    }
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            if table.get(&self.doc) == Some(&self.epoch) {
                table.remove(&self.doc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_exclusive() {
        let leases = LocalLeaseManager::new();
        let doc = Uuid::new_v4();
        let lease = leases.acquire(doc).unwrap();
        assert!(lease.is_valid());
        assert!(leases.acquire(doc).is_err());
        assert!(leases.acquire(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let leases = LocalLeaseManager::new();
        let doc = Uuid::new_v4();
        let first = leases.acquire(doc).unwrap();
        drop(first);
        assert!(!leases.is_held(doc));
        let second = leases.acquire(doc).unwrap();
        assert!(second.epoch() > 1);
    }

    #[test]
    fn test_revoke_fences_old_holder() {
        let leases = LocalLeaseManager::new();
        let doc = Uuid::new_v4();
        let old = leases.acquire(doc).unwrap();
        assert!(leases.revoke(doc));
        assert!(!old.is_valid());

        let new = leases.acquire(doc).unwrap();
        assert!(new.is_valid());
        assert!(!old.is_valid());

        // The stale holder going away must not release the new lease.
        drop(old);
        assert!(new.is_valid());
        assert_eq!(leases.held_count(), 1);
    }
}
