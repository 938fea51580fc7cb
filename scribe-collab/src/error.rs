//! Engine-level error taxonomy.
//!
//! Errors fall into three groups, and callers are expected to branch on
//! the classification methods rather than on individual variants:
//!
//! | group            | variants                                   | caller action            |
//! |------------------|--------------------------------------------|--------------------------|
//! | client input     | `Operation`, `InvalidBaseVersion`          | reject, client resyncs   |
//! | corruption       | `VersionConflict`, `Gap`, `HashMismatch`   | session reloads          |
//! | transient        | `Timeout`, `LoadFailure`, `SessionClosed`, `Storage` | retry with backoff |
//!
//! `LeaseLost` terminates the session; the document must be reopened by
//! whichever instance now holds the lease.

use scribe_ot::OtError;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::LogError;
use crate::DocumentId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Operation(#[from] OtError),

    /// Base is ahead of the document, or older than the retained history.
    #[error("invalid base version {base}: document is at version {current}")]
    InvalidBaseVersion { base: u64, current: u64 },

    #[error("version conflict: expected {expected}, got {got}")]
    VersionConflict { expected: u64, got: u64 },

    #[error("operation log gap: version {missing} is missing")]
    Gap { missing: u64 },

    #[error("content hash mismatch at version {version}")]
    HashMismatch { version: u64 },

    #[error("lease lost for document {0}")]
    LeaseLost(DocumentId),

    #[error("failed to load document {document_id}: {reason}")]
    LoadFailure { document_id: DocumentId, reason: String },

    #[error("{stage} timed out after {elapsed_ms}ms")]
    Timeout { stage: &'static str, elapsed_ms: u64 },

    #[error("document session closed")]
    SessionClosed,

    #[error("document {0} already exists")]
    DocumentExists(DocumentId),

    #[error("document is full ({limit} participants)")]
    DocumentFull { limit: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl EngineError {
    /// The submitter sent something that can never succeed as-is.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Operation(_)
                | EngineError::InvalidBaseVersion { .. }
                | EngineError::DocumentExists(_)
                | EngineError::DocumentFull { .. }
                | EngineError::Protocol(_)
        )
    }

    /// The client's view of the document is unusable and it must rejoin
    /// or catch up from a snapshot.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidBaseVersion { .. }
                | EngineError::VersionConflict { .. }
                | EngineError::Gap { .. }
                | EngineError::HashMismatch { .. }
                | EngineError::LeaseLost(_)
        )
    }

    /// The session drops its in-memory state after this error.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            EngineError::VersionConflict { .. }
                | EngineError::Gap { .. }
                | EngineError::HashMismatch { .. }
                | EngineError::LeaseLost(_)
                | EngineError::Timeout { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. }
                | EngineError::LoadFailure { .. }
                | EngineError::SessionClosed
                | EngineError::Storage(_)
        )
    }

    /// Stable machine-readable code sent to clients in rejections.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Operation(OtError::MalformedOperation { .. }) => "malformed_operation",
            EngineError::Operation(OtError::EmptyOperation) => "empty_operation",
            EngineError::Operation(OtError::IncompatibleOperation { .. }) => {
                "incompatible_operation"
            }
            EngineError::Operation(OtError::Codec(_)) => "codec",
            EngineError::InvalidBaseVersion { .. } => "invalid_base_version",
            EngineError::VersionConflict { .. } => "version_conflict",
            EngineError::Gap { .. } => "log_gap",
            EngineError::HashMismatch { .. } => "hash_mismatch",
            EngineError::LeaseLost(_) => "lease_lost",
            EngineError::LoadFailure { .. } => "load_failure",
            EngineError::Timeout { .. } => "timeout",
            EngineError::SessionClosed => "session_closed",
            EngineError::DocumentExists(_) => "document_exists",
            EngineError::DocumentFull { .. } => "document_full",
            EngineError::Storage(_) => "storage",
            EngineError::Protocol(_) => "protocol",
        }
    }
}

impl From<LogError> for EngineError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::VersionConflict { expected, got } => {
                EngineError::VersionConflict { expected, got }
            }
            LogError::Gap { missing } => EngineError::Gap { missing },
            other => EngineError::Storage(other.to_string()),
        }
    }
}
