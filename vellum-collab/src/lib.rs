//! # vellum-collab — Real-time CRDT document synchronization
//!
//! A collaborative-document synchronization engine: WebSocket transport,
//! binary sync protocol, a from-scratch list CRDT, and a durable
//! RocksDB-backed update log.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │    Binary Proto     │              │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ DocState    │                     │ConnectionHub │
//! │ (local)     │                     └──────┬───────┘
//! └─────────────┘                            │ one actor per doc
//!                                    ┌───────┴────────┐
//!                                    │DocumentSession │
//!                                    └───────┬────────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │   UpdateLog    │
//!                                    │   (RocksDB)    │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — merge engine: [`crdt::DocState`], state vectors, fragments
//! - [`protocol`] — binary wire protocol (sync step 1/2, update, awareness)
//! - [`awareness`] — transient presence, last-writer-wins with expiry
//! - [`storage`] — append-only update log with atomic compaction
//! - [`session`] — actor-per-document execution contexts
//! - [`hub`] — document registry, fan-out, idle eviction
//! - [`server`] — WebSocket transport adapter
//! - [`client`] — WebSocket sync client with a local replica

pub mod awareness;
pub mod client;
pub mod crdt;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessEntry, AwarenessRegistry, AwarenessUpdate};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use crdt::{ClientId, CrdtError, DocState, ItemId, StateVector, UpdateFragment};
pub use hub::{ConnectionHub, HubConfig, Registration};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{ConnectionId, DocumentSession, SessionConfig};
pub use storage::{LoadedDoc, StoreConfig, StoreError, UpdateLog};
