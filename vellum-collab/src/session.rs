//! Per-document sessions: single-owner execution contexts for CRDT state.
//!
//! ```text
//!  connections ──commands──► ┌────────────────────┐
//!                            │   session actor    │──broadcast──► subscribers
//!                            │  (owns DocState)   │
//!                            └─────────┬──────────┘
//!                                      │ ordered persist queue
//!                                      ▼
//!                            ┌────────────────────┐
//!                            │    writer task     │──spawn_blocking──► UpdateLog
//!                            └────────────────────┘
//! ```
//!
//! All mutation of a document's CRDT state is serialized through one actor
//! task, so the state itself carries no locks. Store I/O runs on blocking
//! threads behind an ordered queue: appends land in production order,
//! compactions ride the same queue, and merges never wait on disk.
//! Distinct documents run fully in parallel.
//!
//! A storage failure that survives the retry policy is fatal to the
//! document: the actor stops, subscribers observe the closed broadcast
//! channel and drop their connections, and clients reconnect.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::awareness::{AwarenessRegistry, AwarenessUpdate};
use crate::crdt::{random_client_id, DocState, StateVector, UpdateFragment};
use crate::protocol::{ProtocolError, SyncMessage};
use crate::storage::{StoreError, UpdateLog};

/// Identifies one live transport connection.
pub type ConnectionId = Uuid;

/// A broadcast frame: originating connection plus pre-encoded bytes.
/// Subscribers skip frames carrying their own id.
pub type Outbound = (ConnectionId, Arc<Vec<u8>>);

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broadcast channel capacity per document.
    pub broadcast_capacity: usize,
    /// Unflushed fragments before an asynchronous compaction is triggered.
    pub compact_threshold: u64,
    /// Awareness liveness window.
    pub awareness_window: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            compact_threshold: 64,
            awareness_window: crate::awareness::DEFAULT_LIVENESS_WINDOW,
        }
    }
}

/// The session actor has stopped (storage failure or shutdown).
#[derive(Debug, Clone)]
pub struct SessionClosed;

impl std::fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "document session closed")
    }
}

impl std::error::Error for SessionClosed {}

/// Everything a freshly subscribed connection needs.
pub struct SubscribeAck {
    /// Receiver for fan-out frames.
    pub receiver: broadcast::Receiver<Outbound>,
    /// Encoded `SyncStep1` frame announcing the session's state vector;
    /// sent to the new connection to begin the handshake.
    pub sync_step1: Vec<u8>,
    /// Encoded `Awareness` snapshot frame, if any presence is live.
    pub awareness: Option<Vec<u8>>,
}

enum Command {
    Subscribe {
        conn: ConnectionId,
        reply: oneshot::Sender<SubscribeAck>,
    },
    Unsubscribe {
        conn: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    RemoteUpdate {
        conn: ConnectionId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    SyncStep1 {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, ProtocolError>>,
    },
    Awareness {
        conn: ConnectionId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    StateVector {
        reply: oneshot::Sender<StateVector>,
    },
    Elements {
        reply: oneshot::Sender<Vec<Vec<u8>>>,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
    BroadcastRaw {
        origin: ConnectionId,
        frame: Vec<u8>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

enum PersistJob {
    Append { bytes: Vec<u8> },
    Compact { snapshot: Vec<u8>, up_to_seq: u64 },
    Sync { reply: oneshot::Sender<Result<(), StoreError>> },
}

/// Handle to one open document. Cloneable; all clones address the same
/// actor. Dropping every clone stops the actor.
#[derive(Clone)]
pub struct DocumentSession {
    doc_id: Uuid,
    tx: mpsc::Sender<Command>,
}

impl DocumentSession {
    /// Load a document from the update log and spawn its actor.
    ///
    /// Fails with [`StoreError::Corrupted`] if stored state cannot be
    /// decoded. Singleton-per-document is enforced by the hub's creation
    /// lock, not here.
    pub async fn open(
        doc_id: Uuid,
        store: Arc<UpdateLog>,
        config: SessionConfig,
    ) -> Result<Self, StoreError> {
        let loaded = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.load_latest(doc_id))
                .await
                .map_err(|e| StoreError::Database(e.to_string()))??
        };

        let mut doc = DocState::new(random_client_id());
        if let Some(snapshot) = &loaded.snapshot {
            let frag = UpdateFragment::decode(snapshot).map_err(|e| StoreError::Corrupted {
                doc_id,
                detail: format!("snapshot: {e}"),
            })?;
            doc.apply_update(&frag).map_err(|e| StoreError::Corrupted {
                doc_id,
                detail: format!("snapshot: {e}"),
            })?;
        }
        for (seq, bytes) in &loaded.fragments {
            let frag = UpdateFragment::decode(bytes).map_err(|e| StoreError::Corrupted {
                doc_id,
                detail: format!("fragment {seq}: {e}"),
            })?;
            doc.apply_update(&frag).map_err(|e| StoreError::Corrupted {
                doc_id,
                detail: format!("fragment {seq}: {e}"),
            })?;
        }

        log::info!(
            "opened document {doc_id}: {} elements, {} fragments replayed",
            doc.len(),
            loaded.fragments.len()
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (persist_tx, persist_rx) = mpsc::channel(64);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);

        tokio::spawn(writer_loop(doc_id, store, persist_rx, fatal_tx));

        let actor = SessionActor {
            doc_id,
            doc,
            subscribers: HashSet::new(),
            broadcast_tx,
            awareness: AwarenessRegistry::new(config.awareness_window),
            dirty: loaded.fragments.len() as u64,
            next_seq: loaded.next_seq,
            config,
            persist_tx,
        };
        tokio::spawn(actor.run(cmd_rx, fatal_rx));

        Ok(Self { doc_id, tx: cmd_tx })
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Add a connection to the subscriber set and start its handshake.
    pub async fn subscribe(&self, conn: ConnectionId) -> Result<SubscribeAck, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { conn, reply })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    /// Remove a connection. Returns the number of remaining subscribers.
    pub async fn unsubscribe(&self, conn: ConnectionId) -> Result<usize, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Unsubscribe { conn, reply })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    /// Merge a remote update (or sync-step-2 payload). The merged delta is
    /// persisted and fanned out to the other subscribers.
    pub async fn apply_remote(
        &self,
        conn: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RemoteUpdate { conn, payload, reply })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Answer a peer's state-vector announcement with the encoded
    /// `SyncStep2` frame carrying exactly what it is missing.
    pub async fn sync_step1(&self, payload: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SyncStep1 { payload, reply })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Merge an awareness update and fan it out.
    pub async fn awareness(
        &self,
        conn: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Awareness { conn, payload, reply })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    pub async fn state_vector(&self) -> Result<StateVector, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StateVector { reply })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    /// Live element payloads in document order.
    pub async fn elements(&self) -> Result<Vec<Vec<u8>>, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Elements { reply })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    pub async fn subscriber_count(&self) -> Result<usize, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SubscriberCount { reply })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    /// Fan a pre-encoded frame out to every subscriber except `origin`.
    pub async fn broadcast_raw(
        &self,
        origin: ConnectionId,
        frame: Vec<u8>,
    ) -> Result<(), SessionClosed> {
        self.tx
            .send(Command::BroadcastRaw { origin, frame })
            .await
            .map_err(|_| SessionClosed)
    }

    /// Flush: compact outstanding fragments into a snapshot and sync the
    /// store. Used on idle eviction and server shutdown. A session that
    /// already stopped has nothing left to flush.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Flush { reply }).await.is_err() {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

struct SessionActor {
    doc_id: Uuid,
    doc: DocState,
    subscribers: HashSet<ConnectionId>,
    broadcast_tx: broadcast::Sender<Outbound>,
    awareness: AwarenessRegistry,
    /// Fragments appended since the last compaction.
    dirty: u64,
    /// Next sequence number the log will assign.
    next_seq: u64,
    config: SessionConfig,
    persist_tx: mpsc::Sender<PersistJob>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut fatal_rx: mpsc::Receiver<StoreError>,
    ) {
        let mut prune_tick = tokio::time::interval(self.config.awareness_window / 2);
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(err) = fatal_rx.recv() => {
                    log::error!(
                        "document {} lost its update log ({err}); closing all connections",
                        self.doc_id
                    );
                    break;
                }
                _ = prune_tick.tick() => {
                    let departed = self.awareness.prune();
                    if !departed.is_empty() {
                        self.broadcast_awareness(ConnectionId::nil(), &departed);
                    }
                }
            }
        }
        // Dropping the broadcast sender closes every subscriber's receiver;
        // connection tasks unregister on their way out.
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { conn, reply } => {
                self.subscribers.insert(conn);
                let sync_step1 = SyncMessage::SyncStep1 {
                    state_vector: self.doc.state_vector().encode().unwrap_or_default(),
                }
                .encode();
                let awareness = if self.awareness.client_count() > 0 {
                    self.awareness
                        .snapshot()
                        .encode()
                        .ok()
                        .map(|update| SyncMessage::Awareness { update }.encode())
                } else {
                    None
                };
                let ack = SubscribeAck {
                    receiver: self.broadcast_tx.subscribe(),
                    sync_step1,
                    awareness,
                };
                let _ = reply.send(ack);
            }
            Command::Unsubscribe { conn, reply } => {
                self.subscribers.remove(&conn);
                let _ = reply.send(self.subscribers.len());
            }
            Command::RemoteUpdate { conn, payload, reply } => {
                let result = self.remote_update(conn, &payload).await;
                let _ = reply.send(result);
            }
            Command::SyncStep1 { payload, reply } => {
                let result = self.answer_sync_step1(&payload);
                let _ = reply.send(result);
            }
            Command::Awareness { conn, payload, reply } => {
                let result = self.remote_awareness(conn, &payload);
                let _ = reply.send(result);
            }
            Command::StateVector { reply } => {
                let _ = reply.send(self.doc.state_vector());
            }
            Command::Elements { reply } => {
                let elements = self.doc.elements().iter().map(|e| e.to_vec()).collect();
                let _ = reply.send(elements);
            }
            Command::SubscriberCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
            Command::BroadcastRaw { origin, frame } => {
                let _ = self.broadcast_tx.send((origin, Arc::new(frame)));
            }
            Command::Flush { reply } => {
                if self.dirty > 0 && self.next_seq > 0 {
                    self.enqueue_compaction().await;
                }
                let _ = self.persist_tx.send(PersistJob::Sync { reply }).await;
            }
        }
    }

    async fn remote_update(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let frag = UpdateFragment::decode(payload)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        let applied = self
            .doc
            .apply_update(&frag)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        let Some(applied) = applied else {
            return Ok(()); // fully known, or parked awaiting parents
        };

        let bytes = applied
            .encode()
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        // Persist in production order, then fan out. The writer queue is
        // ordered; a full queue applies backpressure here rather than
        // dropping durability.
        let _ = self
            .persist_tx
            .send(PersistJob::Append { bytes: bytes.clone() })
            .await;
        self.dirty += 1;
        self.next_seq += 1;

        let frame = SyncMessage::Update { update: bytes }.encode();
        let _ = self.broadcast_tx.send((conn, Arc::new(frame)));

        if self.dirty >= self.config.compact_threshold {
            self.enqueue_compaction().await;
        }
        Ok(())
    }

    fn answer_sync_step1(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let peer = StateVector::decode(payload)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        let diff = self.doc.diff(&peer);
        let update = diff
            .encode()
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        Ok(SyncMessage::SyncStep2 { update }.encode())
    }

    fn remote_awareness(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let update = AwarenessUpdate::decode(payload)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        let changed = self.awareness.apply(&update);
        if !changed.is_empty() {
            self.broadcast_awareness(conn, &changed);
        }
        Ok(())
    }

    fn broadcast_awareness(&self, origin: ConnectionId, update: &AwarenessUpdate) {
        if let Ok(update) = update.encode() {
            let frame = SyncMessage::Awareness { update }.encode();
            let _ = self.broadcast_tx.send((origin, Arc::new(frame)));
        }
    }

    async fn enqueue_compaction(&mut self) {
        let snapshot = self.doc.snapshot_fragment();
        match snapshot.encode() {
            Ok(bytes) => {
                log::debug!(
                    "document {}: compacting {} fragments into snapshot",
                    self.doc_id,
                    self.dirty
                );
                let _ = self
                    .persist_tx
                    .send(PersistJob::Compact {
                        snapshot: bytes,
                        up_to_seq: self.next_seq - 1,
                    })
                    .await;
                self.dirty = 0;
            }
            Err(e) => log::error!("document {}: snapshot encode failed: {e}", self.doc_id),
        }
    }
}

/// Ordered persistence pipeline for one document.
///
/// Appends that fail after the store's retry policy are fatal (reported to
/// the actor); compaction failures are not — the fragment log is still
/// durable and compaction retries at the next threshold.
async fn writer_loop(
    doc_id: Uuid,
    store: Arc<UpdateLog>,
    mut rx: mpsc::Receiver<PersistJob>,
    fatal_tx: mpsc::Sender<StoreError>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Append { bytes } => {
                let store = store.clone();
                let result =
                    tokio::task::spawn_blocking(move || store.append(doc_id, &bytes)).await;
                match result {
                    Ok(Ok(seq)) => log::trace!("document {doc_id}: fragment {seq} appended"),
                    Ok(Err(e)) => {
                        let _ = fatal_tx.send(e).await;
                        return;
                    }
                    Err(e) => {
                        let _ = fatal_tx.send(StoreError::Database(e.to_string())).await;
                        return;
                    }
                }
            }
            PersistJob::Compact { snapshot, up_to_seq } => {
                let store = store.clone();
                let result = tokio::task::spawn_blocking(move || {
                    store.compact(doc_id, &snapshot, up_to_seq)
                })
                .await;
                match result {
                    Ok(Ok(removed)) => {
                        log::debug!("document {doc_id}: compacted {removed} fragments")
                    }
                    Ok(Err(e)) => log::error!("document {doc_id}: compaction failed: {e}"),
                    Err(e) => log::error!("document {doc_id}: compaction task failed: {e}"),
                }
            }
            PersistJob::Sync { reply } => {
                let store = store.clone();
                let result = tokio::task::spawn_blocking(move || store.sync()).await;
                let flat = match result {
                    Ok(r) => r,
                    Err(e) => Err(StoreError::Database(e.to_string())),
                };
                let _ = reply.send(flat);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::DocState;
    use crate::storage::StoreConfig;

    async fn open_session() -> (tempfile::TempDir, Arc<UpdateLog>, DocumentSession, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let doc_id = Uuid::new_v4();
        let session = DocumentSession::open(doc_id, store.clone(), SessionConfig::default())
            .await
            .unwrap();
        (dir, store, session, doc_id)
    }

    fn update_frame(doc: &mut DocState, payload: &[u8]) -> Vec<u8> {
        let frag = doc.push(payload.to_vec()).unwrap();
        SyncMessage::Update { update: frag.encode().unwrap() }.encode()
    }

    fn frame_payload(frame: &[u8]) -> Vec<u8> {
        match SyncMessage::decode(frame).unwrap() {
            SyncMessage::SyncStep1 { state_vector } => state_vector,
            SyncMessage::SyncStep2 { update }
            | SyncMessage::Update { update }
            | SyncMessage::Awareness { update } => update,
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_state_vector() {
        let (_dir, _store, session, _doc_id) = open_session().await;

        let conn = Uuid::new_v4();
        let ack = session.subscribe(conn).await.unwrap();
        let msg = SyncMessage::decode(&ack.sync_step1).unwrap();
        assert!(matches!(msg, SyncMessage::SyncStep1 { .. }));
        assert!(ack.awareness.is_none());
        assert_eq!(session.subscriber_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remote_update_applies_and_broadcasts() {
        let (_dir, _store, session, _doc_id) = open_session().await;

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let _ack_a = session.subscribe(alice).await.unwrap();
        let mut ack_b = session.subscribe(bob).await.unwrap();

        let mut replica = DocState::new(7);
        let frame = update_frame(&mut replica, b"hello");
        session
            .apply_remote(alice, frame_payload(&frame))
            .await
            .unwrap();

        assert_eq!(session.elements().await.unwrap(), vec![b"hello".to_vec()]);

        // Bob receives the merged delta, tagged with Alice's connection.
        let (origin, bytes) = ack_b.receiver.recv().await.unwrap();
        assert_eq!(origin, alice);
        let msg = SyncMessage::decode(&bytes).unwrap();
        assert!(matches!(msg, SyncMessage::Update { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_update_not_rebroadcast() {
        let (_dir, _store, session, _doc_id) = open_session().await;

        let alice = Uuid::new_v4();
        let mut ack = session.subscribe(alice).await.unwrap();

        let mut replica = DocState::new(7);
        let payload = frame_payload(&update_frame(&mut replica, b"x"));

        session.apply_remote(alice, payload.clone()).await.unwrap();
        session.apply_remote(alice, payload).await.unwrap();

        // Exactly one broadcast for the two identical updates.
        let first = ack.receiver.try_recv();
        assert!(first.is_ok());
        assert!(ack.receiver.try_recv().is_err());
        assert_eq!(session.elements().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_update_rejected() {
        let (_dir, _store, session, _doc_id) = open_session().await;
        let conn = Uuid::new_v4();
        session.subscribe(conn).await.unwrap();

        let err = session
            .apply_remote(conn, vec![0xFF, 0xFE, 0xFD])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));

        // Session unaffected.
        assert!(session.elements().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_step1_returns_missing_updates() {
        let (_dir, _store, session, _doc_id) = open_session().await;
        let conn = Uuid::new_v4();
        session.subscribe(conn).await.unwrap();

        let mut replica = DocState::new(7);
        session
            .apply_remote(conn, frame_payload(&update_frame(&mut replica, b"a")))
            .await
            .unwrap();
        session
            .apply_remote(conn, frame_payload(&update_frame(&mut replica, b"b")))
            .await
            .unwrap();

        // A peer with nothing gets both elements.
        let empty = StateVector::new();
        let frame = session.sync_step1(empty.encode().unwrap()).await.unwrap();
        let update = frame_payload(&frame);
        let frag = UpdateFragment::decode(&update).unwrap();
        assert_eq!(frag.item_count(), 2);

        // The replica that produced them gets nothing back.
        let frame = session
            .sync_step1(replica.state_vector().encode().unwrap())
            .await
            .unwrap();
        let frag = UpdateFragment::decode(&frame_payload(&frame)).unwrap();
        assert_eq!(frag.item_count(), 0);
    }

    #[tokio::test]
    async fn test_updates_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let doc_id = Uuid::new_v4();

        let mut replica = DocState::new(7);
        {
            let session = DocumentSession::open(doc_id, store.clone(), SessionConfig::default())
                .await
                .unwrap();
            let conn = Uuid::new_v4();
            session.subscribe(conn).await.unwrap();
            session
                .apply_remote(conn, frame_payload(&update_frame(&mut replica, b"durable")))
                .await
                .unwrap();
            session.flush().await.unwrap();
        }

        let session = DocumentSession::open(doc_id, store, SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(session.elements().await.unwrap(), vec![b"durable".to_vec()]);
    }

    #[tokio::test]
    async fn test_compaction_triggered_by_dirty_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let doc_id = Uuid::new_v4();
        let config = SessionConfig { compact_threshold: 5, ..SessionConfig::default() };

        let session = DocumentSession::open(doc_id, store.clone(), config)
            .await
            .unwrap();
        let conn = Uuid::new_v4();
        session.subscribe(conn).await.unwrap();

        let mut replica = DocState::new(7);
        for i in 0..10u8 {
            session
                .apply_remote(conn, frame_payload(&update_frame(&mut replica, &[i])))
                .await
                .unwrap();
        }
        session.flush().await.unwrap();

        let meta = store.meta(doc_id).unwrap();
        assert!(meta.snapshot_seq.is_some(), "compaction ran");

        // Reopen reconstructs the full document from snapshot + tail.
        drop(session);
        let session = DocumentSession::open(doc_id, store, SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(session.elements().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_awareness_fanout_and_snapshot() {
        let (_dir, _store, session, _doc_id) = open_session().await;

        let alice = Uuid::new_v4();
        session.subscribe(alice).await.unwrap();

        let update = AwarenessUpdate::single(1, 0, Some(b"cursor:3".to_vec()));
        session
            .awareness(alice, update.encode().unwrap())
            .await
            .unwrap();

        // A later subscriber receives the presence snapshot in its ack.
        let bob = Uuid::new_v4();
        let ack = session.subscribe(bob).await.unwrap();
        let frame = ack.awareness.expect("awareness snapshot");
        let snap = AwarenessUpdate::decode(&frame_payload(&frame)).unwrap();
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries[0].client, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_remaining() {
        let (_dir, _store, session, _doc_id) = open_session().await;

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        session.subscribe(a).await.unwrap();
        session.subscribe(b).await.unwrap();

        assert_eq!(session.unsubscribe(a).await.unwrap(), 1);
        assert_eq!(session.unsubscribe(b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_log_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let doc_id = Uuid::new_v4();

        // A fragment that is valid at the storage layer but not a fragment.
        store.append(doc_id, b"not a fragment").unwrap();

        let result = DocumentSession::open(doc_id, store, SessionConfig::default()).await;
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }
}
