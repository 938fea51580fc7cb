//! Binary protocol between editing clients and the sync server.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`].
//!
//! ```text
//!   client                                   server
//!     │ ── Join{doc, participant} ─────────────► │
//!     │ ◄──────────── Joined{version, content} ── │
//!     │ ── Submit{op @ base} ───────────────────► │  rebase, append
//!     │ ◄─────────────── Ack{client_op_id, v} ─── │
//!     │ ◄────────── Remote{v, op} (others' ops) ── │
//!     │ ── CatchUp{from} ───────────────────────► │
//!     │ ◄───────────────── CatchUpOps{entries} ── │
//! ```
//!
//! Performance target: encode < 500ns for a typical single-character edit.

use scribe_ot::{ContentHash, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::LogEntry;
use crate::DocumentId;

/// Discriminant of a [`SyncMessage`], handy for stats and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Join = 1,
    Joined = 2,
    Submit = 3,
    Ack = 4,
    Remote = 5,
    Rejected = 6,
    CatchUp = 7,
    CatchUpOps = 8,
    Leave = 9,
    PeerJoined = 10,
    PeerLeft = 11,
    Ping = 12,
    Pong = 13,
}

/// A connected editor.
///
/// `author_id` is the identity carried on operations and used for
/// tie-breaking; one author may be connected through several participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: Uuid,
    pub author_id: String,
    pub name: String,
}

impl Participant {
    pub fn new(author_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), author_id, name)
    }

    /// Create with explicit participant_id (for testing)
    pub fn with_id(participant_id: Uuid, author_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            participant_id,
            author_id: author_id.into(),
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    Join {
        document_id: DocumentId,
        participant: Participant,
    },
    Joined {
        document_id: DocumentId,
        version: u64,
        content: String,
        content_hash: ContentHash,
        participants: Vec<Participant>,
    },
    Submit {
        document_id: DocumentId,
        operation: Operation,
    },
    Ack {
        document_id: DocumentId,
        client_op_id: Uuid,
        version: u64,
        content_hash: ContentHash,
    },
    Remote {
        document_id: DocumentId,
        version: u64,
        operation: Operation,
        content_hash: ContentHash,
    },
    Rejected {
        document_id: DocumentId,
        client_op_id: Option<Uuid>,
        code: String,
        message: String,
        /// Client should drop local state and rejoin.
        resync: bool,
    },
    /// Request every entry after `from_version`.
    CatchUp {
        document_id: DocumentId,
        from_version: u64,
    },
    CatchUpOps {
        document_id: DocumentId,
        entries: Vec<LogEntry>,
    },
    Leave {
        document_id: DocumentId,
    },
    PeerJoined {
        document_id: DocumentId,
        participant: Participant,
    },
    PeerLeft {
        document_id: DocumentId,
        participant_id: Uuid,
    },
    Ping,
    Pong,
}

impl SyncMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::Join { .. } => MessageType::Join,
            SyncMessage::Joined { .. } => MessageType::Joined,
            SyncMessage::Submit { .. } => MessageType::Submit,
            SyncMessage::Ack { .. } => MessageType::Ack,
            SyncMessage::Remote { .. } => MessageType::Remote,
            SyncMessage::Rejected { .. } => MessageType::Rejected,
            SyncMessage::CatchUp { .. } => MessageType::CatchUp,
            SyncMessage::CatchUpOps { .. } => MessageType::CatchUpOps,
            SyncMessage::Leave { .. } => MessageType::Leave,
            SyncMessage::PeerJoined { .. } => MessageType::PeerJoined,
            SyncMessage::PeerLeft { .. } => MessageType::PeerLeft,
            SyncMessage::Ping => MessageType::Ping,
            SyncMessage::Pong => MessageType::Pong,
        }
    }

    /// Document this message concerns, if any.
    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            SyncMessage::Join { document_id, .. }
            | SyncMessage::Joined { document_id, .. }
            | SyncMessage::Submit { document_id, .. }
            | SyncMessage::Ack { document_id, .. }
            | SyncMessage::Remote { document_id, .. }
            | SyncMessage::Rejected { document_id, .. }
            | SyncMessage::CatchUp { document_id, .. }
            | SyncMessage::CatchUpOps { document_id, .. }
            | SyncMessage::Leave { document_id }
            | SyncMessage::PeerJoined { document_id, .. }
            | SyncMessage::PeerLeft { document_id, .. } => Some(*document_id),
            SyncMessage::Ping | SyncMessage::Pong => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// A message arrived that is not valid in the connection's state.
    #[error("unexpected {0:?} message")]
    Unexpected(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
