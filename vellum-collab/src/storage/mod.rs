//! Durable storage for document update logs.
//!
//! ```text
//! ┌──────────────┐   fragments     ┌──────────────┐
//! │ Document     │ ──────────────► │  UpdateLog   │
//! │ session      │                 │  (RocksDB)   │
//! └──────┬───────┘                 └──────┬───────┘
//!        │ on open                        │ column families
//!        ▼                                ▼
//! ┌──────────────┐    ┌─────────────────────────────────────┐
//! │ DocState     │    │ CF "snapshots" — compacted states    │
//! │ (replayed)   │    │ CF "fragments" — append-only deltas  │
//! └──────────────┘    │ CF "meta"      — per-doc bookkeeping │
//!                     └─────────────────────────────────────┘
//! ```
//!
//! The in-memory session is a cache; the log is the source of truth for
//! durability. Values are LZ4-compressed and checksummed; compaction is a
//! single atomic write batch, so a crash leaves either the old fragment
//! log or the new snapshot — never a torn mix.

pub mod log;

pub use log::{DocMeta, LoadedDoc, StoreConfig, StoreError, UpdateLog};
