//! WebSocket transport adapter and server front door.
//!
//! ```text
//! Client A ──┐                       ┌──► UpdateLog (RocksDB)
//!            ├─ ws://host/doc/<id> ──┤
//! Client B ──┘        │              └──► broadcast to peers
//!                     ▼
//!            ┌──────────────────┐
//!            │  ConnectionHub   │── DocumentSession per doc
//!            └──────────────────┘
//! ```
//!
//! The adapter accepts upgraded WebSocket connections, maps the request
//! path (`/doc/<uuid>`) to a document, and bridges socket frames with the
//! document session: inbound frames are decoded and dispatched, outbound
//! broadcast frames are written back. The identity string in the
//! `x-collab-identity` header is treated as opaque and already validated
//! upstream; connections without one are anonymous.
//!
//! Every connection unregisters exactly once — the socket loop has a
//! single exit, and cleanup runs after it regardless of how it ended.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::hub::{ConnectionHub, HubConfig, Registration};
use crate::protocol::SyncMessage;
use crate::session::SessionConfig;
use crate::storage::{StoreConfig, StoreError, UpdateLog};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Update log directory.
    pub storage_path: PathBuf,
    /// Broadcast channel capacity per document.
    pub broadcast_capacity: usize,
    /// Unflushed fragments before a document compacts.
    pub compact_threshold: u64,
    /// Grace period before idle documents are evicted from memory.
    pub idle_grace: Duration,
    /// Awareness liveness window.
    pub awareness_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: PathBuf::from("vellum_data"),
            broadcast_capacity: 256,
            compact_threshold: 64,
            idle_grace: Duration::from_secs(30),
            awareness_window: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Read overrides from the environment:
    /// `VELLUM_BIND_ADDR`, `VELLUM_DATA_DIR`, `VELLUM_IDLE_GRACE_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("VELLUM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("VELLUM_DATA_DIR") {
            config.storage_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("VELLUM_IDLE_GRACE_SECS") {
            if let Ok(secs) = secs.parse() {
                config.idle_grace = Duration::from_secs(secs);
            }
        }
        config
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig {
            idle_grace: self.idle_grace,
            session: SessionConfig {
                broadcast_capacity: self.broadcast_capacity,
                compact_threshold: self.compact_threshold,
                awareness_window: self.awareness_window,
            },
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub open_documents: usize,
}

/// The synchronization server.
pub struct CollabServer {
    config: ServerConfig,
    store: Arc<UpdateLog>,
    hub: Arc<ConnectionHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server, opening the update log at the configured path.
    /// The storage directory is initialized here, before any connection
    /// is accepted.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store_config = StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        };
        let store = Arc::new(UpdateLog::open(store_config)?);
        let hub = ConnectionHub::new(store.clone(), config.hub_config());
        Ok(Self {
            config,
            store,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Accept connections forever. Call from an async runtime; pair with
    /// [`CollabServer::shutdown`] for a clean exit.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "sync server listening on {} (storage: {})",
            self.config.bind_addr,
            self.config.storage_path.display()
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("tcp connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, stats).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Flush every open document (completing in-flight compactions) and
    /// sync the store. Call before process exit.
    pub async fn shutdown(&self) {
        log::info!("shutting down: flushing open documents");
        self.hub.shutdown().await;
        if let Err(e) = self.store.sync() {
            log::error!("final store sync failed: {e}");
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.open_documents = self.hub.open_documents().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<UpdateLog> {
        &self.store
    }
}

/// Map a request path to a document id: `/doc/<uuid>` or `/<uuid>`.
fn parse_doc_path(path: &str) -> Option<Uuid> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let candidate = match segments.as_slice() {
        ["doc", id] => id,
        [id] => id,
        _ => return None,
    };
    Uuid::parse_str(candidate).ok()
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<ConnectionHub>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut doc_id: Option<Uuid> = None;
    let mut identity = String::from("anonymous");

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match parse_doc_path(req.uri().path()) {
            Some(id) => doc_id = Some(id),
            None => {
                let mut reject = ErrorResponse::new(Some("expected path /doc/<uuid>".into()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                return Err(reject);
            }
        }
        if let Some(value) = req.headers().get("x-collab-identity") {
            if let Ok(value) = value.to_str() {
                identity = value.to_string();
            }
        }
        Ok(resp)
    })
    .await?;

    let Some(doc_id) = doc_id else {
        return Ok(()); // handshake was rejected
    };
    let conn_id = Uuid::new_v4();

    log::info!("connection {conn_id} ({identity}) from {addr} joined document {doc_id}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let registration = hub.register(doc_id, conn_id).await;
    let result = match registration {
        Ok(registration) => {
            let outcome = connection_loop(ws_stream, conn_id, registration, &stats).await;
            // Exactly one unregister per connection, however the loop ended.
            hub.unregister(doc_id, conn_id).await;
            outcome
        }
        Err(e) => {
            log::error!("document {doc_id} failed to open: {e}");
            Err(e.into())
        }
    };

    let mut s = stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    drop(s);

    log::info!("connection {conn_id} left document {doc_id}");
    result
}

async fn connection_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    conn_id: Uuid,
    registration: Registration,
    stats: &RwLock<ServerStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let Registration { session, mut ack } = registration;

    // Handshake opener: announce our state vector, and any live presence.
    ws_sender.send(Message::Binary(ack.sync_step1.into())).await?;
    if let Some(awareness) = ack.awareness.take() {
        ws_sender.send(Message::Binary(awareness.into())).await?;
    }

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.messages_received += 1;
                            s.bytes_received += bytes.len() as u64;
                        }
                        let msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("connection {conn_id}: bad frame: {e}");
                                break;
                            }
                        };
                        match msg {
                            SyncMessage::SyncStep1 { state_vector } => {
                                match session.sync_step1(state_vector).await {
                                    Ok(reply) => {
                                        ws_sender.send(Message::Binary(reply.into())).await?;
                                    }
                                    Err(e) => {
                                        log::warn!("connection {conn_id}: sync step 1 rejected: {e}");
                                        break;
                                    }
                                }
                            }
                            SyncMessage::SyncStep2 { update } | SyncMessage::Update { update } => {
                                if let Err(e) = session.apply_remote(conn_id, update).await {
                                    log::warn!("connection {conn_id}: update rejected: {e}");
                                    break;
                                }
                            }
                            SyncMessage::Awareness { update } => {
                                if let Err(e) = session.awareness(conn_id, update).await {
                                    log::warn!("connection {conn_id}: awareness rejected: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("connection {conn_id}: socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            outbound = ack.receiver.recv() => {
                match outbound {
                    Ok((origin, frame)) => {
                        if origin == conn_id {
                            continue; // don't echo the sender's own frames
                        }
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection {conn_id} lagged by {n} frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        // Session stopped (storage failure or eviction race).
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.compact_threshold, 64);
        assert_eq!(config.idle_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_doc_path() {
        let id = Uuid::new_v4();
        assert_eq!(parse_doc_path(&format!("/doc/{id}")), Some(id));
        assert_eq!(parse_doc_path(&format!("/{id}")), Some(id));
        assert_eq!(parse_doc_path(&format!("/doc/{id}/")), Some(id));

        assert!(parse_doc_path("/").is_none());
        assert!(parse_doc_path("/doc/not-a-uuid").is_none());
        assert!(parse_doc_path(&format!("/other/{id}/extra")).is_none());
    }

    #[tokio::test]
    async fn test_server_creation_initializes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        assert!(server.store().path().exists());
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.open_documents, 0);
    }

    #[tokio::test]
    async fn test_shutdown_on_idle_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        server.shutdown().await;
    }
}
