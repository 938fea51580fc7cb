//! One actor per open document.
//!
//! The actor owns the in-memory document, the recent log window, the
//! dedupe table and the document's broadcast group. Commands arrive on a
//! bounded mailbox and are handled one at a time, which is what makes
//! version assignment single-writer.
//!
//! ```text
//!              any command                 load ok
//!   Unloaded ─────────────────► Loading ─────────────► Active ◄──┐
//!      ▲                          │                     │        │ snapshot
//!      │   load failed / timeout  │   snapshot due      ▼        │ written
//!      └──────────────────────────┘                  Flushing ───┘
//!      ▲                                                │
//!      └──── timeout, gap, version conflict ────────────┘
//! ```
//!
//! Submit path: dedupe → base check → validate at base → rebase over
//! `entries(base+1..=current)` → lease check → durable append → commit →
//! ack → broadcast. Nothing is observable before the append succeeds.
//!
//! Storage calls run on the blocking pool under a timeout so a slow disk
//! stalls one document, not the runtime. Submits that arrive while a
//! snapshot is being written wait in a local queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scribe_ot::{ContentHash, Operation};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{AcceptedOperation, BroadcastGroup, Notifier, ParticipantFeed};
use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::lease::{Lease, LeaseProvider};
use crate::protocol::Participant;
use crate::storage::{read_range, LogEntry, OperationLog, Snapshot};
use crate::DocumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Active,
    Flushing,
}

/// Durable acknowledgement of a submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub document_id: DocumentId,
    pub client_op_id: Uuid,
    pub version: u64,
    pub content_hash: ContentHash,
    /// The operation had already been accepted; nothing new was appended.
    pub duplicate: bool,
}

/// Everything a joining participant needs to start editing.
#[derive(Debug)]
pub struct JoinOutcome {
    pub version: u64,
    pub content: String,
    pub content_hash: ContentHash,
    pub participants: Vec<Participant>,
    pub feed: ParticipantFeed,
}

/// Point-in-time view of a document session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: String,
    pub content_hash: ContentHash,
    pub state: SessionState,
    pub participants: Vec<Participant>,
    pub snapshot_version: u64,
    /// Entries appended since the last snapshot.
    pub unflushed: u64,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

pub(crate) enum SessionCommand {
    Join {
        participant: Participant,
        reply: Reply<JoinOutcome>,
    },
    Submit {
        operation: Operation,
        started: Instant,
        timeout: Duration,
        reply: Reply<SubmitAck>,
    },
    Leave {
        participant_id: Uuid,
        reply: Reply<usize>,
    },
    CatchUp {
        from_version: u64,
        reply: Reply<Vec<LogEntry>>,
    },
    State {
        reply: Reply<DocumentState>,
    },
    Create {
        content: String,
        reply: Reply<DocumentState>,
    },
    Flush {
        reply: Reply<u64>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

impl SessionCommand {
    /// Commands that must not interleave with a snapshot write.
    fn is_write(&self) -> bool {
        matches!(
            self,
            SessionCommand::Submit { .. }
                | SessionCommand::Create { .. }
                | SessionCommand::Shutdown { .. }
        )
    }

    fn reject(self, err: EngineError) {
        match self {
            SessionCommand::Join { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Submit { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Leave { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::CatchUp { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::State { reply } | SessionCommand::Create { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Flush { reply } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Bounded (author, client op id) → ack table, oldest evicted first.
struct DedupeWindow {
    acks: HashMap<(String, Uuid), (u64, ContentHash)>,
    order: VecDeque<(String, Uuid)>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            acks: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, author_id: &str, client_op_id: Uuid) -> Option<(u64, ContentHash)> {
        self.acks
            .get(&(author_id.to_string(), client_op_id))
            .copied()
    }

    fn insert(&mut self, author_id: &str, client_op_id: Uuid, version: u64, hash: ContentHash) {
        if self.capacity == 0 {
            return;
        }
        let key = (author_id.to_string(), client_op_id);
        if self.acks.insert(key.clone(), (version, hash)).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.acks.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.acks.len()
    }
}

enum Prepared {
    Duplicate(SubmitAck),
    Append { entry: LogEntry, content: String },
}

/// In-memory state of a loaded document.
struct LoadedDocument {
    document_id: DocumentId,
    version: u64,
    content: String,
    /// `content` length in chars.
    len: usize,
    content_hash: ContentHash,
    snapshot_version: u64,
    /// Contiguous entries ending at `version`, at most `window` long.
    recent: VecDeque<LogEntry>,
    window: usize,
    dedupe: DedupeWindow,
    /// The log holds state for this document (a snapshot or entries).
    persisted: bool,
}

impl LoadedDocument {
    fn new(
        document_id: DocumentId,
        snapshot: Snapshot,
        persisted: bool,
        window: usize,
        dedupe_capacity: usize,
    ) -> Self {
        Self {
            document_id,
            version: snapshot.version,
            len: snapshot.content.chars().count(),
            content: snapshot.content,
            content_hash: snapshot.content_hash,
            snapshot_version: snapshot.version,
            recent: VecDeque::new(),
            window,
            dedupe: DedupeWindow::new(dedupe_capacity),
            persisted,
        }
    }

    fn unflushed(&self) -> u64 {
        self.version - self.snapshot_version
    }

    /// Entries with version > `base`, if they are all still in memory.
    fn entries_after(&self, base: u64) -> Option<std::collections::vec_deque::Iter<'_, LogEntry>> {
        if base > self.version {
            return None;
        }
        let window_start = self
            .recent
            .front()
            .map_or(self.version + 1, |e| e.version);
        if base + 1 < window_start {
            return None;
        }
        let skip = (base + 1 - window_start) as usize;
        Some(self.recent.range(skip.min(self.recent.len())..))
    }

    fn prepare(&self, op: &Operation) -> Result<Prepared, EngineError> {
        if let Some((version, content_hash)) = self.dedupe.get(&op.author_id, op.client_op_id) {
            return Ok(Prepared::Duplicate(SubmitAck {
                document_id: self.document_id,
                client_op_id: op.client_op_id,
                version,
                content_hash,
                duplicate: true,
            }));
        }

        let invalid_base = EngineError::InvalidBaseVersion {
            base: op.base_version,
            current: self.version,
        };
        let intervening = self.entries_after(op.base_version).ok_or(invalid_base)?;

        let base_len = intervening
            .clone()
            .next()
            .map_or(self.len, |e| e.operation.ops.base_len());
        op.validate(base_len)?;

        let mut rebased = op.clone();
        for entry in intervening {
            rebased = rebased.rebase_onto(&entry.operation)?;
        }
        rebased.base_version = self.version;

        let (content, content_hash) = rebased.apply(&self.content)?;
        Ok(Prepared::Append {
            entry: LogEntry {
                version: self.version + 1,
                operation: rebased,
                content_hash,
            },
            content,
        })
    }

    /// Install an entry that is already durable.
    fn commit(&mut self, entry: LogEntry, content: String) -> SubmitAck {
        let ack = SubmitAck {
            document_id: self.document_id,
            client_op_id: entry.operation.client_op_id,
            version: entry.version,
            content_hash: entry.content_hash,
            duplicate: false,
        };
        self.version = entry.version;
        self.len = entry.operation.ops.target_len();
        self.content = content;
        self.content_hash = entry.content_hash;
        self.persisted = true;
        self.remember(entry);
        ack
    }

    /// Track an entry for rebasing and dedupe without applying it.
    fn remember(&mut self, entry: LogEntry) {
        self.dedupe.insert(
            &entry.operation.author_id,
            entry.operation.client_op_id,
            entry.version,
            entry.content_hash,
        );
        if self.window == 0 {
            return;
        }
        self.recent.push_back(entry);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    /// Apply an entry read back from the log, checking it against the
    /// recorded hash.
    fn replay(&mut self, entry: LogEntry) -> Result<(), EngineError> {
        if entry.version != self.version + 1 {
            return Err(EngineError::Gap {
                missing: self.version + 1,
            });
        }
        let version = entry.version;
        let content = entry
            .operation
            .ops
            .apply(&self.content)
            .map_err(|_| EngineError::HashMismatch { version })?;
        if ContentHash::of(&content) != entry.content_hash {
            return Err(EngineError::HashMismatch { version });
        }
        self.commit(entry, content);
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            content: self.content.clone(),
            content_hash: self.content_hash,
        }
    }
}

/// Snapshot, then replay the log tail. Runs on the blocking pool.
fn load_document(
    log: Arc<dyn OperationLog>,
    doc: DocumentId,
    window: usize,
    dedupe_capacity: usize,
) -> Result<LoadedDocument, EngineError> {
    let head = log.head_version(doc)?;
    let snapshot = log.latest_snapshot(doc)?.unwrap_or_else(Snapshot::empty);
    if !snapshot.is_intact() {
        return Err(EngineError::HashMismatch {
            version: snapshot.version,
        });
    }

    let mut loaded = LoadedDocument::new(doc, snapshot, head.is_some(), window, dedupe_capacity);

    // Entries just behind the snapshot keep stale clients rebasable across
    // a reload. Compaction may have removed some; take the contiguous tail.
    if loaded.version > 0 && window > 0 {
        let from = loaded.version.saturating_sub(window as u64) + 1;
        let behind = log.read_page(doc, from, loaded.version, window)?;
        let mut expected = loaded.version;
        let mut tail = Vec::new();
        for entry in behind.into_iter().rev() {
            if entry.version != expected {
                break;
            }
            expected -= 1;
            tail.push(entry);
        }
        for entry in tail.into_iter().rev() {
            loaded.remember(entry);
        }
    }

    for entry in read_range(&log, doc, loaded.version + 1, head.unwrap_or(0)) {
        loaded.replay(entry?)?;
    }
    Ok(loaded)
}

struct FlushOutcome {
    snapshot_version: u64,
    compacted: u64,
}

fn write_snapshot(
    log: Arc<dyn OperationLog>,
    doc: DocumentId,
    snapshot: Snapshot,
    compact_to: u64,
) -> Result<FlushOutcome, EngineError> {
    log.save_snapshot(doc, &snapshot)?;
    let compacted = if compact_to > 0 {
        log.compact(doc, compact_to)?
    } else {
        0
    };
    Ok(FlushOutcome {
        snapshot_version: snapshot.version,
        compacted,
    })
}

type FlushJob = (JoinHandle<Result<FlushOutcome, EngineError>>, tokio::time::Instant);

/// Cheap, cloneable address of a running session actor.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn spawn(
        document_id: DocumentId,
        config: SessionConfig,
        log: Arc<dyn OperationLog>,
        leases: Arc<dyn LeaseProvider>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let actor = SessionActor {
            document_id,
            group: Arc::new(BroadcastGroup::new(document_id, config.broadcast_capacity)),
            config,
            log,
            leases,
            notifier,
            lease: None,
            doc: None,
            last_published: None,
            state: SessionState::Unloaded,
            queued: VecDeque::new(),
            flush_waiters: Vec::new(),
            flush_requested: false,
            terminated: false,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a command and wait for its reply. A session that went away
    /// before answering reports `SessionClosed`.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::SessionClosed)?;
        rx.await.map_err(|_| EngineError::SessionClosed)?
    }
}

struct SessionActor {
    document_id: DocumentId,
    config: SessionConfig,
    log: Arc<dyn OperationLog>,
    leases: Arc<dyn LeaseProvider>,
    notifier: Arc<Notifier>,
    group: Arc<BroadcastGroup>,
    lease: Option<Box<dyn Lease>>,
    doc: Option<LoadedDocument>,
    /// Highest version handed to the broadcast group and notifier.
    last_published: Option<u64>,
    state: SessionState,
    /// Writes held back while a snapshot is in flight.
    queued: VecDeque<SessionCommand>,
    flush_waiters: Vec<Reply<u64>>,
    flush_requested: bool,
    terminated: bool,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let mut flush_job: Option<FlushJob> = None;
        let period = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_activity = tokio::time::Instant::now();

        log::debug!("Session for {} started", self.document_id);

        while !self.terminated {
            let idle_deadline = last_activity + self.config.idle_timeout();
            let evictable = flush_job.is_none()
                && self.queued.is_empty()
                && self.doc.as_ref().map_or(true, |d| d.unflushed() == 0)
                && self.group.participant_count().await == 0;

            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    last_activity = tokio::time::Instant::now();
                    if flush_job.is_some() && cmd.is_write() {
                        self.queued.push_back(cmd);
                    } else {
                        self.handle(cmd).await;
                    }
                }
                result = async {
                    match flush_job.as_mut() {
                        Some((job, deadline)) => tokio::time::timeout_at(*deadline, job).await,
                        None => std::future::pending().await,
                    }
                } => {
                    flush_job = None;
                    match result {
                        Ok(Ok(outcome)) => self.finish_flush(outcome),
                        Ok(Err(join)) => {
                            self.fail_flush(EngineError::Storage(format!("snapshot task failed: {join}")))
                        }
                        Err(_) => self.fail_flush(EngineError::Timeout {
                            stage: "flush",
                            elapsed_ms: self.config.flush_timeout_ms,
                        }),
                    }
                    while flush_job.is_none() && !self.terminated {
                        let Some(cmd) = self.queued.pop_front() else { break };
                        self.handle(cmd).await;
                        if self.flush_requested {
                            flush_job = self.begin_flush();
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.doc.as_ref().is_some_and(|d| d.unflushed() > 0) {
                        self.flush_requested = true;
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline), if evictable => {
                    log::info!("Evicting idle session for {}", self.document_id);
                    break;
                }
            }

            if flush_job.is_none() && self.flush_requested && !self.terminated {
                flush_job = self.begin_flush();
            }
        }

        self.shutdown(rx);
    }

    fn shutdown(&mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        // Release ownership before refusing commands, so a replacement
        // session can take the lease as soon as callers retry.
        self.lease = None;
        self.doc = None;
        self.state = SessionState::Unloaded;
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            cmd.reject(EngineError::SessionClosed);
        }
        for cmd in self.queued.drain(..) {
            cmd.reject(EngineError::SessionClosed);
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(EngineError::SessionClosed));
        }
        log::debug!("Session for {} stopped", self.document_id);
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join { participant, reply } => {
                let _ = reply.send(self.join(participant).await);
            }
            SessionCommand::Submit {
                operation,
                started,
                timeout,
                reply,
            } => {
                let result = self.submit(operation, started, timeout).await;
                if let Err(e) = &result {
                    log::debug!("Submit to {} rejected: {}", self.document_id, e);
                }
                let _ = reply.send(result);
            }
            SessionCommand::Leave {
                participant_id,
                reply,
            } => {
                let _ = reply.send(self.leave(participant_id).await);
            }
            SessionCommand::CatchUp {
                from_version,
                reply,
            } => {
                let _ = reply.send(self.catch_up(from_version).await);
            }
            SessionCommand::State { reply } => {
                let result = match self.ensure_loaded().await {
                    Ok(()) => self.state_view().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Create { content, reply } => {
                let _ = reply.send(self.create(content).await);
            }
            SessionCommand::Flush { reply } => {
                if let Err(e) = self.ensure_loaded().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                match self.doc.as_ref() {
                    Some(doc) if doc.unflushed() > 0 => {
                        self.flush_waiters.push(reply);
                        self.flush_requested = true;
                    }
                    Some(doc) => {
                        let _ = reply.send(Ok(doc.snapshot_version));
                    }
                    None => {
                        let _ = reply.send(Err(EngineError::SessionClosed));
                    }
                }
            }
            SessionCommand::Shutdown { reply } => {
                let result = self.flush_before_shutdown().await;
                // Free the lease before answering so the caller can reopen.
                self.lease = None;
                self.terminated = true;
                let _ = reply.send(result);
            }
        }
    }

    // ─── Loading ──────────────────────────────────────────────────────

    async fn ensure_loaded(&mut self) -> Result<(), EngineError> {
        if self.doc.is_some() {
            return Ok(());
        }

        self.state = SessionState::Loading;
        if self.lease.is_none() {
            match self.leases.acquire(self.document_id) {
                Ok(lease) => self.lease = Some(lease),
                Err(e) => {
                    self.state = SessionState::Unloaded;
                    return Err(e);
                }
            }
        }

        let doc = self.document_id;
        let window = self.config.rebase_window;
        let dedupe_capacity = self.config.dedupe_capacity;
        let result = self
            .blocking("load", self.config.load_timeout(), move |log| {
                load_document(log, doc, window, dedupe_capacity)
            })
            .await;

        match result {
            Ok(loaded) => {
                log::info!(
                    "Loaded {} at v{} (snapshot v{}, {} entries in window)",
                    doc,
                    loaded.version,
                    loaded.snapshot_version,
                    loaded.recent.len()
                );
                let version = loaded.version;
                self.doc = Some(loaded);
                self.state = SessionState::Active;
                match self.last_published {
                    Some(published) if published < version => self.publish_backlog(published).await,
                    Some(_) => Ok(()),
                    None => {
                        self.last_published = Some(version);
                        Ok(())
                    }
                }
            }
            Err(e) => {
                self.state = SessionState::Unloaded;
                Err(match e {
                    EngineError::Gap { .. } | EngineError::HashMismatch { .. } => {
                        log::error!("Log corruption while loading {doc}: {e}");
                        e
                    }
                    EngineError::Timeout { .. } => {
                        log::warn!("Loading {doc} timed out");
                        e
                    }
                    other => EngineError::LoadFailure {
                        document_id: doc,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Publish versions that became durable without reaching subscribers,
    /// such as an append that landed after its timeout fired.
    async fn publish_backlog(&mut self, after: u64) -> Result<(), EngineError> {
        let doc = self.doc.as_ref().ok_or(EngineError::SessionClosed)?;
        let current = doc.version;
        let cached: Option<Vec<LogEntry>> = doc.entries_after(after).map(|e| e.cloned().collect());
        let entries = match cached {
            Some(entries) => entries,
            None => {
                let doc_id = self.document_id;
                let read = self
                    .blocking("backlog", self.config.load_timeout(), move |log| {
                        read_range(&log, doc_id, after + 1, current)
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(EngineError::from)
                    })
                    .await;
                match read {
                    Ok(entries) => entries,
                    Err(e) => {
                        self.reset(&e);
                        return Err(e);
                    }
                }
            }
        };

        log::warn!(
            "Publishing v{}..=v{} of {} found on reload",
            after + 1,
            current,
            self.document_id
        );
        for entry in &entries {
            self.publish(entry);
        }
        Ok(())
    }

    fn publish(&mut self, entry: &LogEntry) {
        let accepted = Arc::new(AcceptedOperation {
            document_id: self.document_id,
            version: entry.version,
            operation: entry.operation.clone(),
            content_hash: entry.content_hash,
        });
        self.group.publish(Arc::clone(&accepted));
        self.notifier.publish(&accepted);
        self.last_published = Some(entry.version);
    }

    /// Run a storage call on the blocking pool, bounded by `limit`.
    async fn blocking<T, F>(&self, stage: &'static str, limit: Duration, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn OperationLog>) -> Result<T, EngineError> + Send + 'static,
    {
        let log = Arc::clone(&self.log);
        let started = Instant::now();
        match tokio::time::timeout(limit, tokio::task::spawn_blocking(move || f(log))).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(EngineError::Storage(format!("{stage} task failed: {join}"))),
            Err(_) => Err(EngineError::Timeout {
                stage,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Drop in-memory state after an error that makes it untrustworthy.
    fn reset(&mut self, cause: &EngineError) {
        match cause {
            EngineError::Timeout { .. } => {
                log::warn!("Session {} reset after {}", self.document_id, cause)
            }
            _ => log::error!("Session {} reset after {}", self.document_id, cause),
        }
        self.doc = None;
        self.state = SessionState::Unloaded;
    }

    fn check_lease(&mut self) -> Result<(), EngineError> {
        if self.lease.as_ref().is_some_and(|l| l.is_valid()) {
            return Ok(());
        }
        log::error!("Lease on {} lost; terminating session", self.document_id);
        self.lease = None;
        self.doc = None;
        self.state = SessionState::Unloaded;
        self.terminated = true;
        Err(EngineError::LeaseLost(self.document_id))
    }

    // ─── Commands ─────────────────────────────────────────────────────

    async fn join(&mut self, participant: Participant) -> Result<JoinOutcome, EngineError> {
        self.ensure_loaded().await?;

        let limit = self.config.max_participants;
        if self.group.participant_count().await >= limit {
            return Err(EngineError::DocumentFull { limit });
        }

        let doc = self.doc.as_ref().ok_or(EngineError::SessionClosed)?;
        let (version, content, content_hash) = (doc.version, doc.content.clone(), doc.content_hash);

        log::info!(
            "{} ({}) joined {} at v{}",
            participant.name,
            participant.author_id,
            self.document_id,
            version
        );
        let feed = self.group.add_participant(participant, version).await;
        Ok(JoinOutcome {
            version,
            content,
            content_hash,
            participants: self.group.participants().await,
            feed,
        })
    }

    async fn leave(&mut self, participant_id: Uuid) -> Result<usize, EngineError> {
        let removed = self.group.remove_participant(&participant_id).await;
        let remaining = self.group.participant_count().await;
        if removed.is_some() {
            log::info!(
                "Participant {} left {} ({} remaining)",
                participant_id,
                self.document_id,
                remaining
            );
            if remaining == 0 && self.doc.as_ref().is_some_and(|d| d.unflushed() > 0) {
                self.flush_requested = true;
            }
        }
        Ok(remaining)
    }

    async fn submit(
        &mut self,
        op: Operation,
        started: Instant,
        timeout: Duration,
    ) -> Result<SubmitAck, EngineError> {
        let expired = || EngineError::Timeout {
            stage: "submit",
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        if started.elapsed() >= timeout {
            return Err(expired());
        }

        self.ensure_loaded().await?;
        let doc = self.doc.as_ref().ok_or(EngineError::SessionClosed)?;

        let (entry, content) = match doc.prepare(&op)? {
            Prepared::Duplicate(ack) => {
                log::debug!(
                    "Duplicate submit {} from {} acknowledged at v{}",
                    op.client_op_id,
                    op.author_id,
                    ack.version
                );
                return Ok(ack);
            }
            Prepared::Append { entry, content } => (entry, content),
        };

        self.check_lease()?;

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(expired());
        }
        let limit = self.config.append_timeout().min(remaining);

        let doc_id = self.document_id;
        let durable = entry.clone();
        if let Err(e) = self
            .blocking("append", limit, move |log| Ok(log.append(doc_id, &durable)?))
            .await
        {
            if e.is_fatal_to_session() {
                self.reset(&e);
            }
            return Err(e);
        }

        let doc = self.doc.as_mut().ok_or(EngineError::SessionClosed)?;
        let ack = doc.commit(entry.clone(), content);
        if doc.unflushed() >= self.config.snapshot_every {
            self.flush_requested = true;
        }

        self.publish(&entry);
        Ok(ack)
    }

    async fn catch_up(&mut self, from_version: u64) -> Result<Vec<LogEntry>, EngineError> {
        self.ensure_loaded().await?;
        let doc = self.doc.as_ref().ok_or(EngineError::SessionClosed)?;
        let current = doc.version;
        if from_version > current {
            return Err(EngineError::InvalidBaseVersion {
                base: from_version,
                current,
            });
        }
        if let Some(entries) = doc.entries_after(from_version) {
            return Ok(entries.cloned().collect());
        }
        let snapshot_version = doc.snapshot_version;

        let doc_id = self.document_id;
        let result = self
            .blocking("catch_up", self.config.load_timeout(), move |log| {
                read_range(&log, doc_id, from_version + 1, current)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(EngineError::from)
            })
            .await;

        match result {
            // Compacted behind the snapshot: the client needs a full rejoin.
            Err(EngineError::Gap { missing }) if missing <= snapshot_version => {
                Err(EngineError::InvalidBaseVersion {
                    base: from_version,
                    current,
                })
            }
            Err(e @ EngineError::Gap { .. }) => {
                self.reset(&e);
                Err(e)
            }
            other => other,
        }
    }

    async fn create(&mut self, content: String) -> Result<DocumentState, EngineError> {
        self.ensure_loaded().await?;
        if self.doc.as_ref().is_some_and(|d| d.persisted || d.version > 0) {
            return Err(EngineError::DocumentExists(self.document_id));
        }
        self.check_lease()?;

        let snapshot = Snapshot::new(0, content);
        let doc_id = self.document_id;
        let durable = snapshot.clone();
        if let Err(e) = self
            .blocking("create", self.config.append_timeout(), move |log| {
                Ok(log.save_snapshot(doc_id, &durable)?)
            })
            .await
        {
            if e.is_fatal_to_session() {
                self.reset(&e);
            }
            return Err(e);
        }

        log::info!("Created {} ({} chars)", doc_id, snapshot.content.chars().count());
        self.last_published = Some(0);
        self.doc = Some(LoadedDocument::new(
            doc_id,
            snapshot,
            true,
            self.config.rebase_window,
            self.config.dedupe_capacity,
        ));
        self.state_view().await
    }

    async fn state_view(&self) -> Result<DocumentState, EngineError> {
        let doc = self.doc.as_ref().ok_or(EngineError::SessionClosed)?;
        Ok(DocumentState {
            document_id: self.document_id,
            version: doc.version,
            content: doc.content.clone(),
            content_hash: doc.content_hash,
            state: self.state,
            participants: self.group.participants().await,
            snapshot_version: doc.snapshot_version,
            unflushed: doc.unflushed(),
        })
    }

    // ─── Flushing ─────────────────────────────────────────────────────

    fn begin_flush(&mut self) -> Option<FlushJob> {
        self.flush_requested = false;

        let Some(doc) = self.doc.as_ref() else {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(Err(EngineError::SessionClosed));
            }
            return None;
        };
        if doc.unflushed() == 0 {
            let version = doc.snapshot_version;
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(Ok(version));
            }
            return None;
        }
        if let Err(e) = self.check_lease() {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(Err(e.clone()));
            }
            return None;
        }

        let Some(doc) = self.doc.as_ref() else {
            return None;
        };
        let snapshot = doc.snapshot();
        let compact_to = snapshot
            .version
            .saturating_sub(self.config.retain_entries_after_snapshot);
        log::debug!(
            "Flushing {} at v{} ({} unflushed)",
            self.document_id,
            snapshot.version,
            doc.unflushed()
        );

        self.state = SessionState::Flushing;
        let log = Arc::clone(&self.log);
        let doc_id = self.document_id;
        let job = tokio::task::spawn_blocking(move || write_snapshot(log, doc_id, snapshot, compact_to));
        let deadline = tokio::time::Instant::now() + self.config.flush_timeout();
        Some((job, deadline))
    }

    fn finish_flush(&mut self, outcome: Result<FlushOutcome, EngineError>) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_flush(e),
        };
        let mut caught_up = true;
        if let Some(doc) = self.doc.as_mut() {
            doc.snapshot_version = doc.snapshot_version.max(outcome.snapshot_version);
            doc.persisted = true;
            caught_up = doc.unflushed() == 0;
            self.state = SessionState::Active;
        }
        log::info!(
            "Snapshot of {} written at v{} ({} entries compacted)",
            self.document_id,
            outcome.snapshot_version,
            outcome.compacted
        );
        // Waiters asked for everything accepted so far; if more arrived
        // while this snapshot was written they wait for the next one.
        if !caught_up && !self.flush_waiters.is_empty() {
            self.flush_requested = true;
            return;
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Ok(outcome.snapshot_version));
        }
    }

    fn fail_flush(&mut self, err: EngineError) {
        log::error!("Snapshot of {} failed: {}", self.document_id, err);
        if err.is_fatal_to_session() {
            self.reset(&err);
        } else if self.doc.is_some() {
            self.state = SessionState::Active;
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    async fn flush_before_shutdown(&mut self) -> Result<(), EngineError> {
        let Some(doc) = self.doc.as_ref() else {
            return Ok(());
        };
        if doc.unflushed() == 0 || !self.lease.as_ref().is_some_and(|l| l.is_valid()) {
            return Ok(());
        }
        let snapshot = doc.snapshot();
        let compact_to = snapshot
            .version
            .saturating_sub(self.config.retain_entries_after_snapshot);
        let doc_id = self.document_id;
        let outcome = self
            .blocking("flush", self.config.flush_timeout(), move |log| {
                write_snapshot(log, doc_id, snapshot, compact_to)
            })
            .await;
        let failed = outcome.as_ref().err().cloned();
        self.finish_flush(outcome);
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
