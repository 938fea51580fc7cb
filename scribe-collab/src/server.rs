//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── SessionActor (doc 1) ── BroadcastGroup
//!            ├── connection tasks ───┤
//! Client B ──┘         │             └── SessionActor (doc 2) ── BroadcastGroup
//!                      │                        │
//!                      ▼                        ├── OperationLog (RocksDB / memory)
//!               SessionManager                  └── Notifier ── HistoryRecorder
//! ```
//!
//! Each connection is one participant of one document. The connection
//! task forwards requests to the [`SessionManager`] and interleaves the
//! participant's feed into the socket.
//!
//! Acks for fresh operations are taken from the feed rather than the
//! submit path, so a client sees `Remote` and `Ack` strictly in version
//! order and can drop anything at or below the last version it saw. Only
//! duplicate resubmissions, which produce no feed event, are acked
//! directly.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Delivery, ParticipantFeed};
use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::manager::SessionManager;
use crate::protocol::{MessageType, Participant, ProtocolError, SyncMessage};
use crate::storage::{DocumentStore, MemoryHistory, MemoryLog, StoreConfig};
use crate::DocumentId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub operations_accepted: u64,
    pub operations_rejected: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SessionManager>,
    /// Persistent document store (optional)
    store: Option<Arc<DocumentStore>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open storage (RocksDB when `storage_path` is set, memory otherwise)
    /// and build the engine on top of it.
    pub fn new(config: ServerConfig) -> Result<Self, EngineError> {
        let (engine, store) = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(DocumentStore::open(StoreConfig::at(path.clone()))?);
                let engine = SessionManager::new(config.engine.clone(), store.clone(), store.clone());
                (engine, Some(store))
            }
            None => {
                log::info!("No storage path configured; documents live in memory only");
                let engine = SessionManager::new(
                    config.engine.clone(),
                    Arc::new(MemoryLog::new()),
                    Arc::new(MemoryHistory::new()),
                );
                (engine, None)
            }
        };

        Ok(Self {
            config,
            engine: Arc::new(engine),
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self {
            engine: Arc::new(SessionManager::in_memory(Default::default())),
            config: ServerConfig::default(),
            store: None,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            {
                let mut s = self.stats.write().await;
                if s.active_connections >= self.config.max_connections as u64 {
                    s.rejected_connections += 1;
                    log::warn!(
                        "Refusing connection from {addr}: {} connections open",
                        s.active_connections
                    );
                    continue;
                }
                s.total_connections += 1;
                s.active_connections += 1;
            }

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats.clone(), config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                let mut s = stats.write().await;
                s.active_connections = s.active_connections.saturating_sub(1);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SessionManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        let mut conn = Connection::default();
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
        heartbeat.tick().await;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                match SyncMessage::decode(&bytes) {
                                    Ok(sync_msg) => {
                                        let reply = conn.handle(&engine, &stats, sync_msg).await;
                                        if let Some(reply) = reply {
                                            send(&mut ws_sender, &reply).await?;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    delivery = async {
                        match conn.feed.as_mut() {
                            Some(feed) => feed.recv().await,
                            // Not joined yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        for out in conn.deliver(&engine, delivery).await {
                            send(&mut ws_sender, &out).await?;
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::<u8>::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: detach the participant even if the socket errored
        if let (Some(doc), Some(participant)) = (conn.document_id, conn.participant.take()) {
            match engine.leave_document(doc, participant.participant_id).await {
                Ok(remaining) => log::debug!("{} left {doc}, {remaining} remaining", participant.name),
                Err(e) => log::warn!("Leave for {} on {doc} failed: {e}", participant.participant_id),
            }
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.engine.open_sessions().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SessionManager> {
        &self.engine
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    /// Flush and close every open document.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        if let Some(store) = &self.store {
            if let Err(e) = store.sync() {
                log::error!("Failed to sync document store: {e}");
            }
        }
    }
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

fn rejected(document_id: DocumentId, client_op_id: Option<uuid::Uuid>, err: &EngineError) -> SyncMessage {
    SyncMessage::Rejected {
        document_id,
        client_op_id,
        code: err.code().to_string(),
        message: err.to_string(),
        resync: err.requires_resync(),
    }
}

/// Per-connection state: at most one joined document.
#[derive(Default)]
struct Connection {
    document_id: Option<DocumentId>,
    participant: Option<Participant>,
    feed: Option<ParticipantFeed>,
}

impl Connection {
    /// Joined document matching `doc`, or the protocol error to report.
    fn joined(&self, doc: DocumentId, msg: &SyncMessage) -> Result<&Participant, EngineError> {
        match (&self.participant, self.document_id) {
            (Some(participant), Some(joined)) if joined == doc => Ok(participant),
            _ => Err(ProtocolError::Unexpected(msg.message_type()).into()),
        }
    }

    fn detach(&mut self) {
        self.document_id = None;
        self.participant = None;
        self.feed = None;
    }

    async fn handle(
        &mut self,
        engine: &SessionManager,
        stats: &RwLock<ServerStats>,
        msg: SyncMessage,
    ) -> Option<SyncMessage> {
        match msg {
            SyncMessage::Join {
                document_id,
                participant,
            } => {
                if self.document_id.is_some() {
                    let err: EngineError = ProtocolError::Unexpected(MessageType::Join).into();
                    return Some(rejected(document_id, None, &err));
                }
                match engine.join_document(document_id, participant.clone()).await {
                    Ok(joined) => {
                        log::info!(
                            "Participant {} ({}) joined doc {} at v{}",
                            participant.name,
                            participant.participant_id,
                            document_id,
                            joined.version
                        );
                        self.document_id = Some(document_id);
                        self.participant = Some(participant);
                        self.feed = Some(joined.feed);
                        Some(SyncMessage::Joined {
                            document_id,
                            version: joined.version,
                            content: joined.content,
                            content_hash: joined.content_hash,
                            participants: joined.participants,
                        })
                    }
                    Err(e) => {
                        log::warn!("Join of {document_id} failed: {e}");
                        Some(rejected(document_id, None, &e))
                    }
                }
            }

            SyncMessage::Submit {
                document_id,
                ref operation,
            } => {
                let client_op_id = operation.client_op_id;
                let author = match self.joined(document_id, &msg) {
                    Ok(participant) => participant.author_id.clone(),
                    Err(e) => return Some(rejected(document_id, Some(client_op_id), &e)),
                };
                if operation.author_id != author {
                    let err: EngineError = ProtocolError::Unexpected(msg.message_type()).into();
                    return Some(rejected(document_id, Some(client_op_id), &err));
                }

                let result = engine.submit(document_id, operation.clone()).await;
                let mut s = stats.write().await;
                match result {
                    Ok(ack) if ack.duplicate => Some(SyncMessage::Ack {
                        document_id,
                        client_op_id: ack.client_op_id,
                        version: ack.version,
                        content_hash: ack.content_hash,
                    }),
                    Ok(_) => {
                        s.operations_accepted += 1;
                        None
                    }
                    Err(e) => {
                        s.operations_rejected += 1;
                        Some(rejected(document_id, Some(client_op_id), &e))
                    }
                }
            }

            SyncMessage::CatchUp {
                document_id,
                from_version,
            } => {
                if let Err(e) = self.joined(document_id, &msg) {
                    return Some(rejected(document_id, None, &e));
                }
                Some(self.catch_up(engine, document_id, from_version).await)
            }

            SyncMessage::Leave { document_id } => {
                if let Err(e) = self.joined(document_id, &msg) {
                    return Some(rejected(document_id, None, &e));
                }
                if let Some(participant) = self.participant.take() {
                    if let Err(e) = engine.leave_document(document_id, participant.participant_id).await {
                        log::warn!("Leave of {document_id} failed: {e}");
                    }
                }
                self.detach();
                None
            }

            SyncMessage::Ping => Some(SyncMessage::Pong),

            other => {
                log::debug!("Unhandled message type: {:?}", other.message_type());
                let err: EngineError = ProtocolError::Unexpected(other.message_type()).into();
                other
                    .document_id()
                    .map(|document_id| rejected(document_id, None, &err))
            }
        }
    }

    async fn catch_up(&mut self, engine: &SessionManager, document_id: DocumentId, from_version: u64) -> SyncMessage {
        match engine.catch_up(document_id, from_version).await {
            Ok(entries) => {
                if let (Some(feed), Some(last)) = (self.feed.as_mut(), entries.last()) {
                    feed.advance_to(last.version);
                }
                SyncMessage::CatchUpOps {
                    document_id,
                    entries,
                }
            }
            Err(e) => rejected(document_id, None, &e),
        }
    }

    /// Translate one feed delivery into outgoing messages.
    async fn deliver(&mut self, engine: &SessionManager, delivery: Option<Delivery>) -> Vec<SyncMessage> {
        let Some(document_id) = self.document_id else {
            return Vec::new();
        };
        match delivery {
            Some(Delivery::Remote(op)) => vec![SyncMessage::Remote {
                document_id,
                version: op.version,
                operation: op.operation.clone(),
                content_hash: op.content_hash,
            }],
            Some(Delivery::Ack(op)) => vec![SyncMessage::Ack {
                document_id,
                client_op_id: op.operation.client_op_id,
                version: op.version,
                content_hash: op.content_hash,
            }],
            Some(Delivery::PeerJoined(participant)) => vec![SyncMessage::PeerJoined {
                document_id,
                participant,
            }],
            Some(Delivery::PeerLeft(participant_id)) => vec![SyncMessage::PeerLeft {
                document_id,
                participant_id,
            }],
            Some(Delivery::Lagged { last_version, .. }) => {
                vec![self.catch_up(engine, document_id, last_version).await]
            }
            None => {
                // The session ended under us (lease loss or shutdown).
                log::warn!("Session for {document_id} ended; asking participant to rejoin");
                self.detach();
                vec![rejected(document_id, None, &EngineError::SessionClosed)]
            }
        }
    }
}
