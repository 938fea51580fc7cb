//! Fan-out of accepted operations.
//!
//! Two layers:
//!
//! ```text
//!   SessionActor ──► BroadcastGroup (per document) ──► ParticipantFeed × N
//!        │
//!        └────────► Notifier (process wide)
//!                     ├─ accepted stream  ──► HistoryRecorder
//!                     └─ invalidations    ──► read caches
//! ```
//!
//! Everything here runs strictly after the durable append; nothing is
//! published for an operation that is not in the log.
//!
//! Delivery is at-least-once. A feed that falls behind the channel
//! capacity surfaces [`Delivery::Lagged`] and must catch up from the log.
//!
//! Performance target: 1,000 operations to 100 participants < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scribe_ot::{ContentHash, Operation};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::Participant;
use crate::DocumentId;

/// An operation that is durable at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedOperation {
    pub document_id: DocumentId,
    pub version: u64,
    /// Rebased form, applicable to the document at `version - 1`.
    pub operation: Operation,
    pub content_hash: ContentHash,
}

/// "Document changed, drop anything cached below `version`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    pub document_id: DocumentId,
    pub version: u64,
}

/// Events carried on a document's channel.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Accepted(Arc<AcceptedOperation>),
    PeerJoined(Participant),
    PeerLeft(Uuid),
}

/// What a participant's feed hands to its connection.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Someone else's operation.
    Remote(Arc<AcceptedOperation>),
    /// The participant's own operation, now durable.
    Ack(Arc<AcceptedOperation>),
    PeerJoined(Participant),
    PeerLeft(Uuid),
    /// `skipped` events were lost; resume by catching up after `last_version`.
    Lagged { skipped: u64, last_version: u64 },
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub operations_sent: u64,
    pub active_participants: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    operations_sent: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            events_sent: AtomicU64::new(0),
            operations_sent: AtomicU64::new(0),
        }
    }
}

/// The broadcast channel and participant set for one document.
pub struct BroadcastGroup {
    document_id: DocumentId,

    sender: broadcast::Sender<RoomEvent>,

    /// Connected participants, keyed by participant id.
    participants: Arc<RwLock<HashMap<Uuid, Participant>>>,

    /// Events buffered per receiver before it lags.
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(document_id: DocumentId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            document_id,
            sender,
            participants: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a participant and hand back its feed, positioned so the
    /// first delivery is the operation after `current_version`.
    ///
    /// The feed subscribes before the participant is announced, so nothing
    /// published after this call is missed.
    pub async fn add_participant(
        &self,
        participant: Participant,
        current_version: u64,
    ) -> ParticipantFeed {
        let rx = self.sender.subscribe();
        self.participants
            .write()
            .await
            .insert(participant.participant_id, participant.clone());
        self.send(RoomEvent::PeerJoined(participant.clone()));
        ParticipantFeed::new(rx, participant, current_version)
    }

    pub async fn remove_participant(&self, participant_id: &Uuid) -> Option<Participant> {
        let removed = self.participants.write().await.remove(participant_id);
        if removed.is_some() {
            self.send(RoomEvent::PeerLeft(*participant_id));
        }
        removed
    }

    /// Publish an accepted operation. Returns the number of live receivers.
    pub fn publish(&self, op: Arc<AcceptedOperation>) -> usize {
        self.atomic_stats
            .operations_sent
            .fetch_add(1, Ordering::Relaxed);
        self.send(RoomEvent::Accepted(op))
    }

    fn send(&self, event: RoomEvent) -> usize {
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: nobody is watching yet.
        self.sender.send(event).unwrap_or(0)
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> =
            self.participants.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        list
    }

    pub async fn has_participant(&self, participant_id: &Uuid) -> bool {
        self.participants.read().await.contains_key(participant_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            operations_sent: self.atomic_stats.operations_sent.load(Ordering::Relaxed),
            active_participants: self.participants.read().await.len(),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One participant's view of a document's channel.
///
/// Turns the participant's own operations into acks and drops anything at
/// or below the last version it has seen, so redelivery is harmless.
pub struct ParticipantFeed {
    rx: broadcast::Receiver<RoomEvent>,
    participant: Participant,
    last_version: u64,
}

impl std::fmt::Debug for ParticipantFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantFeed")
            .field("participant", &self.participant.participant_id)
            .field("last_version", &self.last_version)
            .finish()
    }
}

impl ParticipantFeed {
    fn new(rx: broadcast::Receiver<RoomEvent>, participant: Participant, last_version: u64) -> Self {
        Self {
            rx,
            participant,
            last_version,
        }
    }

    /// Next delivery, or `None` once the document session is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(delivery) = self.filter(event) {
                        return Some(delivery);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Participant {} lagged by {} events at v{}",
                        self.participant.participant_id,
                        skipped,
                        self.last_version
                    );
                    return Some(Delivery::Lagged {
                        skipped,
                        last_version: self.last_version,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn filter(&mut self, event: RoomEvent) -> Option<Delivery> {
        match event {
            RoomEvent::Accepted(op) => {
                if op.version <= self.last_version {
                    return None;
                }
                self.last_version = op.version;
                if op.operation.author_id == self.participant.author_id {
                    Some(Delivery::Ack(op))
                } else {
                    Some(Delivery::Remote(op))
                }
            }
            RoomEvent::PeerJoined(p) if p.participant_id == self.participant.participant_id => None,
            RoomEvent::PeerJoined(p) => Some(Delivery::PeerJoined(p)),
            RoomEvent::PeerLeft(id) if id == self.participant.participant_id => None,
            RoomEvent::PeerLeft(id) => Some(Delivery::PeerLeft(id)),
        }
    }

    /// Record that versions up to `version` were delivered out of band
    /// (for example through a catch-up read).
    pub fn advance_to(&mut self, version: u64) {
        self.last_version = self.last_version.max(version);
    }

    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifierStats {
    pub published: u64,
    pub invalidations_sent: u64,
}

/// Process-wide notification streams.
pub struct Notifier {
    accepted: broadcast::Sender<Arc<AcceptedOperation>>,
    invalidations: broadcast::Sender<CacheInvalidation>,
    published: AtomicU64,
    invalidations_sent: AtomicU64,
}

impl Notifier {
    pub fn new(accepted_capacity: usize, invalidation_capacity: usize) -> Self {
        let (accepted, _) = broadcast::channel(accepted_capacity.max(1));
        let (invalidations, _) = broadcast::channel(invalidation_capacity.max(1));
        Self {
            accepted,
            invalidations,
            published: AtomicU64::new(0),
            invalidations_sent: AtomicU64::new(0),
        }
    }

    /// Announce a durable operation to internal subscribers and caches.
    pub fn publish(&self, op: &Arc<AcceptedOperation>) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.accepted.send(Arc::clone(op));

        let invalidation = CacheInvalidation {
            document_id: op.document_id,
            version: op.version,
        };
        if self.invalidations.send(invalidation).is_ok() {
            self.invalidations_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe_accepted(&self) -> broadcast::Receiver<Arc<AcceptedOperation>> {
        self.accepted.subscribe()
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<CacheInvalidation> {
        self.invalidations.subscribe()
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            published: self.published.load(Ordering::Relaxed),
            invalidations_sent: self.invalidations_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn accepted(doc: DocumentId, version: u64, author: &str) -> Arc<AcceptedOperation> {
        let op = Operation::insert_at(version - 1, author, (version - 1) as usize, 0, "x");
        Arc::new(AcceptedOperation {
            document_id: doc,
            version,
            content_hash: ContentHash::of(&"x".repeat(version as usize)),
            operation: op,
        })
    }

    #[tokio::test]
    async fn test_add_remove_participant() {
        let group = BroadcastGroup::new(Uuid::new_v4(), 16);
        let alice = Participant::new("alice", "Alice");
        let id = alice.participant_id;

        let _feed = group.add_participant(alice, 0).await;
        assert_eq!(group.participant_count().await, 1);
        assert!(group.has_participant(&id).await);

        assert!(group.remove_participant(&id).await.is_some());
        assert_eq!(group.participant_count().await, 0);
        assert!(group.remove_participant(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_feed_acks_own_and_forwards_remote() {
        let doc = Uuid::new_v4();
        let group = BroadcastGroup::new(doc, 16);
        let mut alice = group.add_participant(Participant::new("alice", "Alice"), 0).await;

        group.publish(accepted(doc, 1, "alice"));
        group.publish(accepted(doc, 2, "bob"));

        assert!(matches!(alice.recv().await, Some(Delivery::Ack(op)) if op.version == 1));
        assert!(matches!(alice.recv().await, Some(Delivery::Remote(op)) if op.version == 2));
        assert_eq!(alice.last_version(), 2);
    }

    #[tokio::test]
    async fn test_feed_drops_redelivered_versions() {
        let doc = Uuid::new_v4();
        let group = BroadcastGroup::new(doc, 16);
        let mut feed = group.add_participant(Participant::new("alice", "Alice"), 3).await;

        group.publish(accepted(doc, 2, "bob"));
        group.publish(accepted(doc, 3, "bob"));
        group.publish(accepted(doc, 4, "bob"));
        group.publish(accepted(doc, 4, "bob"));

        assert!(matches!(feed.recv().await, Some(Delivery::Remote(op)) if op.version == 4));
        let next = timeout(Duration::from_millis(50), feed.recv()).await;
        assert!(next.is_err(), "duplicate v4 must be filtered");
    }

    #[tokio::test]
    async fn test_feed_sees_peers_but_not_itself() {
        let group = BroadcastGroup::new(Uuid::new_v4(), 16);
        let mut alice = group.add_participant(Participant::new("alice", "Alice"), 0).await;
        let bob = Participant::new("bob", "Bob");
        let bob_id = bob.participant_id;
        let _bob_feed = group.add_participant(bob, 0).await;
        group.remove_participant(&bob_id).await;

        assert!(matches!(alice.recv().await, Some(Delivery::PeerJoined(p)) if p.participant_id == bob_id));
        assert!(matches!(alice.recv().await, Some(Delivery::PeerLeft(id)) if id == bob_id));
    }

    #[tokio::test]
    async fn test_feed_reports_lag() {
        let doc = Uuid::new_v4();
        let group = BroadcastGroup::new(doc, 4);
        let mut feed = group.add_participant(Participant::new("alice", "Alice"), 0).await;

        for v in 1..=10 {
            group.publish(accepted(doc, v, "bob"));
        }
        match feed.recv().await {
            Some(Delivery::Lagged { skipped, last_version }) => {
                assert!(skipped > 0);
                assert_eq!(last_version, 0);
            }
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        let room1 = BroadcastGroup::new(doc1, 16);
        let room2 = BroadcastGroup::new(doc2, 16);

        let mut feed1 = room1.add_participant(Participant::new("alice", "Alice"), 0).await;
        let _feed2 = room2.add_participant(Participant::new("bob", "Bob"), 0).await;

        room2.publish(accepted(doc2, 1, "bob"));
        let result = timeout(Duration::from_millis(100), feed1.recv()).await;
        assert!(result.is_err(), "room1 should not receive room2 operations");
    }

    #[tokio::test]
    async fn test_notifier_streams() {
        let notifier = Notifier::new(16, 16);
        let mut ops = notifier.subscribe_accepted();
        let mut inval = notifier.subscribe_invalidations();
        let doc = Uuid::new_v4();

        notifier.publish(&accepted(doc, 1, "alice"));

        assert_eq!(ops.recv().await.unwrap().version, 1);
        assert_eq!(
            inval.recv().await.unwrap(),
            CacheInvalidation {
                document_id: doc,
                version: 1
            }
        );
        assert_eq!(notifier.stats().published, 1);
    }

    #[tokio::test]
    async fn test_high_throughput_fanout() {
        let doc = Uuid::new_v4();
        let group = BroadcastGroup::new(doc, 2048);
        let mut feeds = Vec::new();
        for i in 0..100 {
            feeds.push(
                group
                    .add_participant(Participant::new(format!("p{i}"), format!("P{i}")), 0)
                    .await,
            );
        }

        let ops: Vec<_> = (1..=1000).map(|v| accepted(doc, v, "writer")).collect();
        let start = std::time::Instant::now();
        for op in ops {
            group.publish(op);
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed.as_millis() < 100,
            "1000 publishes took {elapsed:?}, expected <100ms"
        );
        assert_eq!(group.stats().await.active_participants, 100);
    }
}
