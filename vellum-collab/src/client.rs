//! WebSocket sync client.
//!
//! Owns a local replica of the document and keeps it converged with the
//! server: on connect the client announces its state vector, answers the
//! server's announcement with a diff, and from then on exchanges
//! incremental updates. Edits made while disconnected live in the local
//! replica and flow to the server through the state-vector handshake on
//! the next connect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::crdt::{random_client_id, ClientId, DocState, StateVector};
use crate::protocol::{ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted to the embedding application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and handshake started.
    Connected,
    /// Connection lost.
    Disconnected,
    /// The server's reply to our state vector has been merged.
    Synced,
    /// A remote delta was merged into the local replica.
    RemoteChange,
    /// A remote presence update arrived.
    Awareness(AwarenessUpdate),
}

/// The sync client.
pub struct SyncClient {
    client_id: ClientId,
    doc_id: Uuid,
    server_url: String,
    doc: Arc<Mutex<DocState>>,
    state: Arc<RwLock<ConnectionState>>,
    awareness_clock: AtomicU64,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    close_tx: Option<tokio::sync::oneshot::Sender<()>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a client for one document. `server_url` is the base
    /// WebSocket URL, e.g. `ws://127.0.0.1:9090`.
    pub fn new(server_url: impl Into<String>, doc_id: Uuid) -> Self {
        let client_id = random_client_id();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id,
            doc_id,
            server_url: server_url.into(),
            doc: Arc::new(Mutex::new(DocState::new(client_id))),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            awareness_clock: AtomicU64::new(0),
            outgoing_tx: None,
            close_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and start the sync handshake. Spawns reader and writer
    /// tasks; events arrive on the receiver from [`Self::take_event_rx`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/doc/{}", self.server_url, self.doc_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("connect to {url} failed: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        let (close_tx, mut close_rx) = tokio::sync::oneshot::channel::<()>();
        self.close_tx = Some(close_tx);

        // Writer task: forward the outgoing channel onto the socket. The
        // close signal (or the client being dropped) ends the connection
        // with a proper close frame.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = &mut close_rx => break,
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Open with our state vector; the server replies with a diff.
        let sv = self.doc.lock().await.state_vector();
        let opener = SyncMessage::SyncStep1 {
            state_vector: sv.encode().map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?,
        };
        let _ = out_tx.send(opener.encode()).await;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: merge server frames into the local replica.
        let doc = self.doc.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Err(e) =
                            handle_frame(&bytes, &doc, &out_tx, &event_tx).await
                        {
                            log::warn!("client: dropping connection on bad frame: {e}");
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Insert an element into the local replica and send the delta.
    pub async fn insert(
        &self,
        index: usize,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), ProtocolError> {
        let frag = {
            let mut doc = self.doc.lock().await;
            doc.insert(index, payload)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?
        };
        let update = frag
            .encode()
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        self.send_frame(SyncMessage::Update { update }.encode()).await;
        Ok(())
    }

    /// Append an element at the end of the document.
    pub async fn push(&self, payload: impl Into<Vec<u8>>) -> Result<(), ProtocolError> {
        self.insert(usize::MAX, payload).await
    }

    /// Delete the element at `index` and send the delta.
    pub async fn delete(&self, index: usize) -> Result<(), ProtocolError> {
        let frag = {
            let mut doc = self.doc.lock().await;
            doc.delete(index)
        };
        let Some(frag) = frag else {
            return Err(ProtocolError::InvalidPayload(format!(
                "no element at index {index}"
            )));
        };
        let update = frag
            .encode()
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        self.send_frame(SyncMessage::Update { update }.encode()).await;
        Ok(())
    }

    /// Publish a presence blob (`None` announces departure).
    pub async fn send_awareness(&self, blob: Option<Vec<u8>>) -> Result<(), ProtocolError> {
        let clock = self.awareness_clock.fetch_add(1, Ordering::Relaxed);
        let update = AwarenessUpdate::single(self.client_id, clock, blob);
        let payload = update
            .encode()
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        self.send_frame(SyncMessage::Awareness { update: payload }.encode()).await;
        Ok(())
    }

    /// Live element payloads of the local replica.
    pub async fn elements(&self) -> Vec<Vec<u8>> {
        let doc = self.doc.lock().await;
        doc.elements().iter().map(|e| e.to_vec()).collect()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.doc.lock().await.state_vector()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Close the connection. Local edits survive and re-sync through the
    /// handshake on the next [`Self::connect`].
    pub fn disconnect(&mut self) {
        if let Some(close) = self.close_tx.take() {
            let _ = close.send(());
        }
        self.outgoing_tx = None;
    }

    /// Best-effort send; edits survive locally and re-sync on reconnect.
    async fn send_frame(&self, frame: Vec<u8>) {
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(frame).await;
        }
    }
}

/// Handle one inbound server frame.
async fn handle_frame(
    bytes: &[u8],
    doc: &Arc<Mutex<DocState>>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    event_tx: &mpsc::Sender<SyncEvent>,
) -> Result<(), ProtocolError> {
    match SyncMessage::decode(bytes)? {
        SyncMessage::SyncStep1 { state_vector } => {
            // The server announced its vector; reply with what it lacks.
            let peer = StateVector::decode(&state_vector)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
            let diff = {
                let doc = doc.lock().await;
                doc.diff(&peer)
            };
            if !diff.is_empty() {
                let update = diff
                    .encode()
                    .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
                let _ = out_tx.send(SyncMessage::SyncStep2 { update }.encode()).await;
            }
            Ok(())
        }
        SyncMessage::SyncStep2 { update } => {
            apply_update_bytes(&update, doc).await?;
            let _ = event_tx.send(SyncEvent::Synced).await;
            Ok(())
        }
        SyncMessage::Update { update } => {
            if apply_update_bytes(&update, doc).await? {
                let _ = event_tx.send(SyncEvent::RemoteChange).await;
            }
            Ok(())
        }
        SyncMessage::Awareness { update } => {
            let update = AwarenessUpdate::decode(&update)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
            let _ = event_tx.send(SyncEvent::Awareness(update)).await;
            Ok(())
        }
    }
}

/// Decode and merge an update; true if anything new was applied.
async fn apply_update_bytes(
    update: &[u8],
    doc: &Arc<Mutex<DocState>>,
) -> Result<bool, ProtocolError> {
    let frag = crate::crdt::UpdateFragment::decode(update)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    let mut doc = doc.lock().await;
    let applied = doc
        .apply_update(&frag)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    Ok(applied.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new("ws://localhost:9090", doc_id);
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mut client = SyncClient::new("ws://localhost:9090", Uuid::new_v4());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.elements().await.is_empty());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_offline_edits_stay_local() {
        let client = SyncClient::new("ws://localhost:9090", Uuid::new_v4());

        client.push(b"one".to_vec()).await.unwrap();
        client.push(b"two".to_vec()).await.unwrap();
        client.delete(0).await.unwrap();

        assert_eq!(client.elements().await, vec![b"two".to_vec()]);
        assert_eq!(client.state_vector().await.get(client.client_id()), 2);
    }

    #[tokio::test]
    async fn test_delete_out_of_bounds_errors() {
        let client = SyncClient::new("ws://localhost:9090", Uuid::new_v4());
        assert!(client.delete(3).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing is listening on this port.
        let mut client = SyncClient::new("ws://127.0.0.1:1", Uuid::new_v4());
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
