//! Document registry and the engine's public entry point.
//!
//! `SessionManager` maps document ids to session actors, spawning one on
//! first use and replacing it transparently once it has been evicted or
//! terminated. Different documents never share an actor, so they proceed
//! in parallel.
//!
//! A command that races with an actor shutting down comes back as
//! `SessionClosed`; it is re-dispatched to a fresh session up to
//! `max_dispatch_attempts` times.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scribe_ot::Operation;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{AcceptedOperation, CacheInvalidation, Notifier, NotifierStats};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::history::{ChangeRecord, HistoryRecorder, HistoryStats, HistoryStore};
use crate::lease::{LeaseProvider, LocalLeaseManager};
use crate::protocol::Participant;
use crate::session::{DocumentState, JoinOutcome, Reply, SessionCommand, SessionHandle, SubmitAck};
use crate::storage::{LogEntry, MemoryHistory, MemoryLog, OperationLog};
use crate::DocumentId;

pub struct SessionManager {
    config: EngineConfig,
    log: Arc<dyn OperationLog>,
    leases: Arc<dyn LeaseProvider>,
    notifier: Arc<Notifier>,
    history: Arc<HistoryRecorder>,
    sessions: RwLock<HashMap<DocumentId, SessionHandle>>,
    /// Accepted stream subscribed at construction, handed to the recorder
    /// task on first use.
    pending_recorder: Mutex<Option<broadcast::Receiver<Arc<AcceptedOperation>>>>,
    recorder_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manager with an in-process lease table.
    pub fn new(
        config: EngineConfig,
        log: Arc<dyn OperationLog>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self::with_lease_provider(config, log, history_store, Arc::new(LocalLeaseManager::new()))
    }

    pub fn with_lease_provider(
        config: EngineConfig,
        log: Arc<dyn OperationLog>,
        history_store: Arc<dyn HistoryStore>,
        leases: Arc<dyn LeaseProvider>,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(
            config.accepted_capacity,
            config.invalidation_capacity,
        ));
        let history = Arc::new(HistoryRecorder::new(history_store, config.change_feed_capacity));
        let accepted = notifier.subscribe_accepted();
        Self {
            config,
            log,
            leases,
            notifier,
            history,
            sessions: RwLock::new(HashMap::new()),
            pending_recorder: Mutex::new(Some(accepted)),
            recorder_task: Mutex::new(None),
        }
    }

    /// Everything in memory; nothing survives the process.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(MemoryLog::new()), Arc::new(MemoryHistory::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn OperationLog> {
        &self.log
    }

    // ─── Document operations ──────────────────────────────────────────

    /// Write version 0 of a new document.
    pub async fn create_document(
        &self,
        doc: DocumentId,
        content: impl Into<String>,
    ) -> Result<DocumentState, EngineError> {
        let content = content.into();
        self.dispatch(doc, |reply| SessionCommand::Create {
            content: content.clone(),
            reply,
        })
        .await
    }

    /// Attach a participant, loading the document if needed.
    pub async fn join_document(
        &self,
        doc: DocumentId,
        participant: Participant,
    ) -> Result<JoinOutcome, EngineError> {
        self.dispatch(doc, |reply| SessionCommand::Join {
            participant: participant.clone(),
            reply,
        })
        .await
    }

    /// Submit with the configured default timeout.
    pub async fn submit(&self, doc: DocumentId, operation: Operation) -> Result<SubmitAck, EngineError> {
        self.submit_with_timeout(doc, operation, self.config.session.submit_timeout())
            .await
    }

    /// Submit, giving up once `timeout` has elapsed. The deadline covers
    /// queueing, loading and the durable append.
    pub async fn submit_with_timeout(
        &self,
        doc: DocumentId,
        operation: Operation,
        timeout: Duration,
    ) -> Result<SubmitAck, EngineError> {
        let started = Instant::now();
        self.dispatch(doc, |reply| SessionCommand::Submit {
            operation: operation.clone(),
            started,
            timeout,
            reply,
        })
        .await
    }

    /// Detach a participant. Returns the number still connected.
    pub async fn leave_document(&self, doc: DocumentId, participant_id: Uuid) -> Result<usize, EngineError> {
        let Some(handle) = self.existing(doc).await else {
            return Ok(0);
        };
        match handle
            .request(|reply| SessionCommand::Leave {
                participant_id,
                reply,
            })
            .await
        {
            // The session is gone and took its participants with it.
            Err(EngineError::SessionClosed) => Ok(0),
            other => other,
        }
    }

    /// Accepted entries with version > `from_version`.
    pub async fn catch_up(&self, doc: DocumentId, from_version: u64) -> Result<Vec<LogEntry>, EngineError> {
        self.dispatch(doc, |reply| SessionCommand::CatchUp {
            from_version,
            reply,
        })
        .await
    }

    /// Force a snapshot. Returns the version it was taken at.
    pub async fn flush(&self, doc: DocumentId) -> Result<u64, EngineError> {
        self.dispatch(doc, |reply| SessionCommand::Flush { reply }).await
    }

    pub async fn document_state(&self, doc: DocumentId) -> Result<DocumentState, EngineError> {
        self.dispatch(doc, |reply| SessionCommand::State { reply }).await
    }

    /// Flush and stop the session for `doc`, if one is running.
    pub async fn close_document(&self, doc: DocumentId) -> Result<(), EngineError> {
        let handle = self.sessions.write().await.remove(&doc);
        match handle {
            Some(handle) => match handle.request(|reply| SessionCommand::Shutdown { reply }).await {
                Err(EngineError::SessionClosed) => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }

    /// Flush and stop every session.
    pub async fn shutdown(&self) {
        let handles: Vec<(DocumentId, SessionHandle)> =
            self.sessions.write().await.drain().collect();
        log::info!("Shutting down {} sessions", handles.len());
        for (doc, handle) in handles {
            match handle.request(|reply| SessionCommand::Shutdown { reply }).await {
                Ok(()) | Err(EngineError::SessionClosed) => {}
                Err(e) => log::error!("Final flush of {doc} failed: {e}"),
            }
        }
    }

    // ─── Feeds ────────────────────────────────────────────────────────

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<CacheInvalidation> {
        self.notifier.subscribe_invalidations()
    }

    /// Stream of accepted operations across all documents.
    pub fn subscribe_accepted(&self) -> broadcast::Receiver<Arc<AcceptedOperation>> {
        self.notifier.subscribe_accepted()
    }

    /// Change records, published after they are stored.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeRecord> {
        self.ensure_recorder();
        self.history.subscribe()
    }

    pub fn changes_since(&self, doc: DocumentId, after_version: u64) -> Result<Vec<ChangeRecord>, EngineError> {
        Ok(self.history.changes_since(doc, after_version)?)
    }

    // ─── Introspection ────────────────────────────────────────────────

    /// Number of live sessions. Closed handles are pruned.
    pub async fn open_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, handle| !handle.is_closed());
        sessions.len()
    }

    pub async fn is_open(&self, doc: DocumentId) -> bool {
        self.existing(doc).await.is_some()
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier.stats()
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.history.stats()
    }

    // ─── Dispatch ─────────────────────────────────────────────────────

    async fn dispatch<T>(
        &self,
        doc: DocumentId,
        make: impl Fn(Reply<T>) -> SessionCommand,
    ) -> Result<T, EngineError> {
        self.ensure_recorder();
        let attempts = self.config.max_dispatch_attempts.max(1);
        for attempt in 1..=attempts {
            let handle = self.session(doc).await;
            match handle.request(&make).await {
                Err(EngineError::SessionClosed) => {
                    log::debug!("Session for {doc} closed under dispatch (attempt {attempt}/{attempts})");
                }
                other => return other,
            }
        }
        Err(EngineError::SessionClosed)
    }

    async fn existing(&self, doc: DocumentId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&doc)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Live handle for `doc`, spawning a session if there is none.
    async fn session(&self, doc: DocumentId) -> SessionHandle {
        if let Some(handle) = self.existing(doc).await {
            return handle;
        }
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&doc).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        log::debug!("Spawning session for {doc}");
        let handle = SessionHandle::spawn(
            doc,
            self.config.session.clone(),
            Arc::clone(&self.log),
            Arc::clone(&self.leases),
            Arc::clone(&self.notifier),
        );
        sessions.insert(doc, handle.clone());
        handle
    }

    fn ensure_recorder(&self) {
        let Ok(mut pending) = self.pending_recorder.lock() else {
            return;
        };
        if let Some(rx) = pending.take() {
            let task = Arc::clone(&self.history).spawn(rx);
            if let Ok(mut slot) = self.recorder_task.lock() {
                *slot = Some(task);
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.recorder_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
