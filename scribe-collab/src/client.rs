//! Editor-side WebSocket client for one participant of one document.
//!
//! Provides:
//! - Connection lifecycle (connect, join, leave, disconnect)
//! - Operation submit with an offline queue for edits made while
//!   disconnected
//! - Version-based dedupe of server deliveries
//!
//! The server delivers remote operations and acks in version order, so the
//! client only has to remember the highest version it has seen.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_ot::{ContentHash, Operation};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Participant, ProtocolError, SyncMessage};
use crate::storage::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the client reports to the embedding editor.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Initial document state
    Joined {
        version: u64,
        content: String,
        content_hash: ContentHash,
        participants: Vec<Participant>,
    },
    /// One of our operations is durable
    Acked {
        client_op_id: Uuid,
        version: u64,
        content_hash: ContentHash,
    },
    /// Another participant's operation, rebased onto `version - 1`
    Remote {
        version: u64,
        operation: Operation,
        content_hash: ContentHash,
    },
    /// Entries we had not seen, in version order
    CaughtUp(Vec<LogEntry>),
    Rejected {
        client_op_id: Option<Uuid>,
        code: String,
        message: String,
        resync: bool,
    },
    PeerJoined(Participant),
    PeerLeft(Uuid),
    Pong,
}

/// Operations submitted while disconnected, replayed after the next join.
///
/// Replay relies on the server's (author, client op id) dedupe, so an
/// operation that did reach the server before the connection dropped is
/// acknowledged again rather than applied twice.
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, operation: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(operation);
        true
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server for one
/// participant of one document.
pub struct SyncClient {
    participant: Participant,
    doc_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    /// Highest document version seen from the server
    version: Arc<AtomicU64>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Frames for the writer task; `None` while disconnected.
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    pub fn new(participant: Participant, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            participant,
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            version: Arc::new(AtomicU64::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Hand out the event stream. Only the first call gets it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the document and replay queued operations.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", self.server_url, e);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = SyncMessage::Join {
            document_id: self.doc_id,
            participant: self.participant.clone(),
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // The server handles messages in order, so queued submits land
        // after the join.
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
        }
        for operation in queued {
            let msg = SyncMessage::Submit {
                document_id: self.doc_id,
                operation,
            };
            out_tx
                .send(msg.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let version = self.version.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if let Some(event) = to_event(sync_msg, &version) {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => log::warn!("Undecodable message from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit an operation. Queued for replay if disconnected.
    pub async fn submit(&self, operation: Operation) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(operation) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        self.send(&SyncMessage::Submit {
            document_id: self.doc_id,
            operation,
        })
        .await
    }

    /// Ask for every entry after `from_version`.
    pub async fn catch_up(&self, from_version: u64) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::CatchUp {
            document_id: self.doc_id,
            from_version,
        })
        .await
    }

    /// Ask for everything after the last version we saw.
    pub async fn resync(&self) -> Result<(), ProtocolError> {
        self.catch_up(self.version()).await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::Leave {
            document_id: self.doc_id,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::Ping).await
    }

    /// Close the connection. The server treats it as a leave.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Highest document version seen from the server.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

/// Map a server message to an application event, dropping versions
/// already seen.
fn to_event(msg: SyncMessage, seen: &AtomicU64) -> Option<SyncEvent> {
    match msg {
        SyncMessage::Joined {
            version,
            content,
            content_hash,
            participants,
            ..
        } => {
            seen.store(version, Ordering::SeqCst);
            Some(SyncEvent::Joined {
                version,
                content,
                content_hash,
                participants,
            })
        }
        SyncMessage::Ack {
            client_op_id,
            version,
            content_hash,
            ..
        } => {
            seen.fetch_max(version, Ordering::SeqCst);
            Some(SyncEvent::Acked {
                client_op_id,
                version,
                content_hash,
            })
        }
        SyncMessage::Remote {
            version,
            operation,
            content_hash,
            ..
        } => {
            if seen.fetch_max(version, Ordering::SeqCst) >= version {
                log::trace!("Dropping already seen v{version}");
                return None;
            }
            Some(SyncEvent::Remote {
                version,
                operation,
                content_hash,
            })
        }
        SyncMessage::CatchUpOps { entries, .. } => {
            let floor = seen.load(Ordering::SeqCst);
            let fresh: Vec<LogEntry> = entries.into_iter().filter(|e| e.version > floor).collect();
            if let Some(last) = fresh.last() {
                seen.fetch_max(last.version, Ordering::SeqCst);
            }
            Some(SyncEvent::CaughtUp(fresh))
        }
        SyncMessage::Rejected {
            client_op_id,
            code,
            message,
            resync,
            ..
        } => Some(SyncEvent::Rejected {
            client_op_id,
            code,
            message,
            resync,
        }),
        SyncMessage::PeerJoined { participant, .. } => Some(SyncEvent::PeerJoined(participant)),
        SyncMessage::PeerLeft { participant_id, .. } => Some(SyncEvent::PeerLeft(participant_id)),
        SyncMessage::Pong => Some(SyncEvent::Pong),
        other => {
            log::debug!("Ignoring {:?} from server", other.message_type());
            None
        }
    }
}
