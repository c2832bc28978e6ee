//! RocksDB-backed append-only update log.
//!
//! Column families:
//! - `snapshots` — compacted document states (LZ4, checksummed)
//! - `fragments` — update fragments, keyed by `doc_id:seq` (LZ4, checksummed)
//! - `meta`      — per-document bookkeeping (next sequence, snapshot point)
//!
//! Per-document sequence numbers are assigned by `append`; callers
//! serialize appends per document (the session's writer queue does this),
//! while distinct documents may read and write concurrently.
//!
//! Transient RocksDB write errors are retried with exponential backoff;
//! after the attempts are exhausted the error surfaces to the caller —
//! durability is never silently skipped.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

type Db = DBWithThreadMode<MultiThreaded>;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_FRAGMENTS: &str = "fragments";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_FRAGMENTS, CF_META];

/// Write attempts before a storage error becomes fatal to the document.
const WRITE_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; doubles each retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false — RocksDB WAL covers crashes)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vellum_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMeta {
    pub doc_id: Uuid,
    /// Next fragment sequence number to assign.
    pub next_seq: u64,
    /// Fragments currently on disk (since the last compaction).
    pub fragment_count: u64,
    /// Highest sequence number covered by the stored snapshot.
    pub snapshot_seq: Option<u64>,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocMeta {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            next_seq: 0,
            fragment_count: 0,
            snapshot_seq: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Result of opening a document from the log.
#[derive(Debug, Clone)]
pub struct LoadedDoc {
    /// Compacted snapshot, if one exists.
    pub snapshot: Option<Vec<u8>>,
    /// Fragments after the snapshot, in sequence order.
    pub fragments: Vec<(u64, Vec<u8>)>,
    /// Next sequence number the log will assign.
    pub next_seq: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error (retried before it reaches the caller).
    Database(String),
    /// Document has no stored state.
    NotFound(Uuid),
    /// A stored record failed its checksum or could not be decompressed.
    /// Operator intervention required; no automatic data-loss recovery.
    Corrupted { doc_id: Uuid, detail: String },
    /// Bookkeeping record could not be (de)serialized.
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::NotFound(id) => write!(f, "document not found: {id}"),
            StoreError::Corrupted { doc_id, detail } => {
                write!(f, "document {doc_id} corrupted: {detail}")
            }
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Append-only, per-document durable log of update fragments plus
/// periodic compacted snapshots.
pub struct UpdateLog {
    db: Db,
    config: StoreConfig,
}

impl UpdateLog {
    /// Open the log at the configured path, creating the database and
    /// column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed by us already.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_FRAGMENTS => {
                // Many small writes, prefix-scanned by doc_id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Fragment log ─────────────────────────────────────────────────

    /// Durably append a fragment after all prior fragments for the
    /// document. Returns the sequence number assigned.
    pub fn append(&self, doc_id: Uuid, fragment: &[u8]) -> Result<u64, StoreError> {
        let sealed = seal(fragment);
        self.write_with_retry(|| {
            let cf_frag = self.cf(CF_FRAGMENTS)?;
            let cf_meta = self.cf(CF_META)?;

            let mut meta = self.meta_or_new(doc_id)?;
            let seq = meta.next_seq;
            meta.next_seq += 1;
            meta.fragment_count += 1;
            meta.updated_at = unix_now();

            let mut batch = WriteBatch::default();
            batch.put_cf(&cf_frag, fragment_key(doc_id, seq), &sealed);
            batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
            self.write(batch)?;
            Ok(seq)
        })
    }

    /// Load the latest snapshot (if any) plus every fragment appended
    /// after it, in sequence order. A document with no stored state loads
    /// as empty.
    pub fn load_latest(&self, doc_id: Uuid) -> Result<LoadedDoc, StoreError> {
        let meta = match self.meta(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => {
                return Ok(LoadedDoc { snapshot: None, fragments: Vec::new(), next_seq: 0 })
            }
            Err(e) => return Err(e),
        };

        let snapshot = match meta.snapshot_seq {
            Some(_) => {
                let cf = self.cf(CF_SNAPSHOTS)?;
                match self.db.get_cf(&cf, doc_id.as_bytes())? {
                    Some(sealed) => Some(unseal(&sealed).map_err(|detail| {
                        StoreError::Corrupted { doc_id, detail }
                    })?),
                    None => {
                        return Err(StoreError::Corrupted {
                            doc_id,
                            detail: "snapshot recorded in meta but missing".into(),
                        })
                    }
                }
            }
            None => None,
        };

        let start = meta.snapshot_seq.map_or(0, |s| s + 1);
        let mut fragments = Vec::new();
        let cf = self.cf(CF_FRAGMENTS)?;
        let start_key = fragment_key(doc_id, start);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[16..24]);
            let seq = u64::from_be_bytes(seq_buf);

            let bytes = unseal(&value)
                .map_err(|detail| StoreError::Corrupted { doc_id, detail })?;
            fragments.push((seq, bytes));
        }

        Ok(LoadedDoc { snapshot, fragments, next_seq: meta.next_seq })
    }

    /// Atomically replace all fragments up to `up_to_seq` with one
    /// snapshot. Returns the number of fragments removed.
    ///
    /// Snapshot put, fragment deletes and the meta update share a single
    /// write batch; a crash mid-compaction leaves either the old log or
    /// the new snapshot intact.
    pub fn compact(
        &self,
        doc_id: Uuid,
        snapshot: &[u8],
        up_to_seq: u64,
    ) -> Result<u64, StoreError> {
        let sealed = seal(snapshot);
        self.write_with_retry(|| {
            let cf_snap = self.cf(CF_SNAPSHOTS)?;
            let cf_frag = self.cf(CF_FRAGMENTS)?;
            let cf_meta = self.cf(CF_META)?;

            let mut meta = self.meta_or_new(doc_id)?;

            let mut batch = WriteBatch::default();
            batch.put_cf(&cf_snap, doc_id.as_bytes(), &sealed);

            let mut removed = 0u64;
            let start_key = fragment_key(doc_id, 0);
            let iter = self.db.iterator_cf(
                &cf_frag,
                IteratorMode::From(&start_key, rocksdb::Direction::Forward),
            );
            for entry in iter {
                let (key, _) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
                if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                    break;
                }
                let mut seq_buf = [0u8; 8];
                seq_buf.copy_from_slice(&key[16..24]);
                if u64::from_be_bytes(seq_buf) > up_to_seq {
                    break;
                }
                batch.delete_cf(&cf_frag, &key);
                removed += 1;
            }

            meta.snapshot_seq = Some(up_to_seq);
            meta.fragment_count = meta.fragment_count.saturating_sub(removed);
            meta.next_seq = meta.next_seq.max(up_to_seq + 1);
            meta.updated_at = unix_now();
            batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);

            self.write(batch)?;
            Ok(removed)
        })
    }

    // ─── Bookkeeping ──────────────────────────────────────────────────

    pub fn meta(&self, doc_id: Uuid) -> Result<DocMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocMeta::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    /// All document ids present in the store.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut doc_ids = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() == 16 {
                let bytes: [u8; 16] = key.as_ref().try_into().map_err(|_| {
                    StoreError::Serialization("invalid document key".into())
                })?;
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(doc_ids)
    }

    /// Remove a document's snapshot, fragments and bookkeeping.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_frag = self.cf(CF_FRAGMENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());

        let start_key = fragment_key(doc_id, 0);
        let iter = self
            .db
            .iterator_cf(&cf_frag, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for entry in iter {
            let (key, _) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_frag, &key);
        }

        self.write(batch)?;
        Ok(())
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn meta_or_new(&self, doc_id: Uuid) -> Result<DocMeta, StoreError> {
        match self.meta(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocMeta::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Run a write operation, retrying transient database errors with
    /// exponential backoff. Called from blocking-thread context.
    fn write_with_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut backoff = RETRY_BACKOFF;
        let mut last_err = None;
        for attempt in 0..WRITE_ATTEMPTS {
            match op() {
                Ok(v) => return Ok(v),
                Err(e @ StoreError::Database(_)) => {
                    log::warn!("storage write attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Database("write failed".into())))
    }
}

/// Key for a fragment: `doc_id (16 bytes) ++ seq (8 bytes big-endian)`.
fn fragment_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Compress and prepend a checksum: `crc (4 bytes LE) ++ lz4(payload)`.
fn seal(payload: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::compress_prepend_size(payload);
    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&checksum(&compressed).to_le_bytes());
    out.extend_from_slice(&compressed);
    out
}

/// Verify the checksum and decompress.
fn unseal(raw: &[u8]) -> Result<Vec<u8>, String> {
    if raw.len() < 4 {
        return Err("record too short".into());
    }
    let (crc_bytes, compressed) = raw.split_at(4);
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(crc_bytes);
    let expected = u32::from_le_bytes(crc_buf);
    if checksum(compressed) != expected {
        return Err("checksum mismatch".into());
    }
    lz4_flex::decompress_size_prepended(compressed).map_err(|e| e.to_string())
}

/// FNV-folded checksum over a byte slice.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
