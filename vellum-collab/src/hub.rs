//! Connection hub: the per-process registry of open documents.
//!
//! Maps DocumentID → [`DocumentSession`] and routes connections to their
//! sessions. The registry lock doubles as the creation lock: the first
//! connection for a document loads it from the update log while later
//! arrivals wait and reuse the same in-memory session.
//!
//! When a document's last subscriber leaves, an idle-eviction timer
//! starts; if no one returns within the grace period the session is
//! flushed (final compaction) and discarded — its durable state is
//! already safe in the update log. A re-register cancels the timer.
//!
//! The hub is an explicitly owned instance passed to the components that
//! need document lookup; there is no ambient global registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::session::{
    ConnectionId, DocumentSession, SessionClosed, SessionConfig, SubscribeAck,
};
use crate::storage::{StoreError, UpdateLog};

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Grace period before an idle document is evicted from memory.
    pub idle_grace: Duration,
    /// Session configuration applied to every opened document.
    pub session: SessionConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(30),
            session: SessionConfig::default(),
        }
    }
}

struct DocEntry {
    session: DocumentSession,
    /// Pending idle-eviction timer, if the subscriber set is empty.
    evict_timer: Option<JoinHandle<()>>,
}

/// Everything a newly registered connection needs to run.
pub struct Registration {
    pub session: DocumentSession,
    pub ack: SubscribeAck,
}

/// Per-document registry of active sessions and their connections.
pub struct ConnectionHub {
    store: Arc<UpdateLog>,
    config: HubConfig,
    docs: Arc<RwLock<HashMap<Uuid, DocEntry>>>,
}

impl ConnectionHub {
    pub fn new(store: Arc<UpdateLog>, config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            docs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Open or reuse the session for `doc_id`, subscribe the connection,
    /// and hand back the handshake opener (`SyncStep1`).
    pub async fn register(
        self: &Arc<Self>,
        doc_id: Uuid,
        conn: ConnectionId,
    ) -> Result<Registration, StoreError> {
        let mut docs = self.docs.write().await;

        // Cancel a pending eviction; the document is live again.
        if let Some(entry) = docs.get_mut(&doc_id) {
            if let Some(timer) = entry.evict_timer.take() {
                timer.abort();
            }
            if let Ok(ack) = entry.session.subscribe(conn).await {
                return Ok(Registration { session: entry.session.clone(), ack });
            }
            // The session died (storage failure); fall through and reopen.
            docs.remove(&doc_id);
        }

        let session =
            DocumentSession::open(doc_id, self.store.clone(), self.config.session.clone()).await?;
        let ack = session
            .subscribe(conn)
            .await
            .map_err(|_| StoreError::Database("session closed during open".into()))?;
        docs.insert(doc_id, DocEntry { session: session.clone(), evict_timer: None });
        log::info!("document {doc_id} opened in memory");
        Ok(Registration { session, ack })
    }

    /// Remove a connection from its document. Called exactly once per
    /// connection by the transport adapter. Starts the idle-eviction
    /// timer when the last subscriber leaves.
    pub async fn unregister(self: &Arc<Self>, doc_id: Uuid, conn: ConnectionId) {
        let mut docs = self.docs.write().await;
        let Some(entry) = docs.get_mut(&doc_id) else {
            return;
        };

        let remaining = match entry.session.unsubscribe(conn).await {
            Ok(remaining) => remaining,
            Err(SessionClosed) => {
                docs.remove(&doc_id);
                return;
            }
        };

        if remaining == 0 {
            let hub = self.clone();
            let grace = self.config.idle_grace;
            entry.evict_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                hub.evict_if_idle(doc_id).await;
            }));
        }
    }

    /// Fan a pre-encoded frame out to every subscriber of `doc_id` except
    /// `exclude`. Best-effort per connection: a lagging or closed receiver
    /// never blocks delivery to the others.
    pub async fn broadcast(&self, doc_id: Uuid, frame: Vec<u8>, exclude: ConnectionId) {
        let session = {
            let docs = self.docs.read().await;
            docs.get(&doc_id).map(|entry| entry.session.clone())
        };
        if let Some(session) = session {
            let _ = session.broadcast_raw(exclude, frame).await;
        }
    }

    /// Look up the in-memory session for a document, if open.
    pub async fn session(&self, doc_id: Uuid) -> Option<DocumentSession> {
        let docs = self.docs.read().await;
        docs.get(&doc_id).map(|entry| entry.session.clone())
    }

    /// Number of documents currently resident in memory.
    pub async fn open_documents(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Flush every open session and drop it. Called on server shutdown so
    /// in-flight compactions complete before exit.
    pub async fn shutdown(&self) {
        let mut docs = self.docs.write().await;
        for (doc_id, entry) in docs.drain() {
            if let Some(timer) = entry.evict_timer {
                timer.abort();
            }
            if let Err(e) = entry.session.flush().await {
                log::error!("document {doc_id}: flush on shutdown failed: {e}");
            }
        }
    }

    async fn evict_if_idle(self: Arc<Self>, doc_id: Uuid) {
        let mut docs = self.docs.write().await;
        let Some(entry) = docs.get(&doc_id) else {
            return;
        };
        match entry.session.subscriber_count().await {
            Ok(0) | Err(SessionClosed) => {
                let entry = match docs.remove(&doc_id) {
                    Some(entry) => entry,
                    None => return,
                };
                drop(docs); // flush can take a while; release the registry
                if let Err(e) = entry.session.flush().await {
                    log::error!("document {doc_id}: flush on eviction failed: {e}");
                }
                log::info!("document {doc_id} evicted after idle grace period");
            }
            Ok(_) => {
                // A connection raced the timer; the document stays.
            }
        }
    }
}
