//! Durability and crash-safety tests for the update log.
//!
//! "Crash" here means dropping the store (or session) without any
//! graceful flush and reopening the same directory: RocksDB's write-ahead
//! log makes every acknowledged batch durable, and compaction is a single
//! atomic batch, so recovery sees either the old fragment log or the new
//! snapshot — never a torn mix.

use std::sync::Arc;

use uuid::Uuid;
use vellum_collab::crdt::DocState;
use vellum_collab::session::{DocumentSession, SessionConfig};
use vellum_collab::storage::{StoreConfig, UpdateLog};

/// Build a document's fragment history: returns the encoded fragments and
/// the expected final elements.
fn edit_history() -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut doc = DocState::new(1);
    let mut fragments = Vec::new();
    for i in 0..8u8 {
        fragments.push(doc.push(vec![b'e', i]).unwrap().encode().unwrap());
    }
    fragments.push(doc.delete(2).unwrap().encode().unwrap());
    fragments.push(doc.insert(0, b"head".to_vec()).unwrap().encode().unwrap());
    let expected = doc.elements().iter().map(|e| e.to_vec()).collect();
    (fragments, expected)
}

/// Replay whatever the log holds into a fresh replica.
fn replay(log: &UpdateLog, doc_id: Uuid) -> Vec<Vec<u8>> {
    let loaded = log.load_latest(doc_id).unwrap();
    let mut doc = DocState::new(99);
    if let Some(snapshot) = &loaded.snapshot {
        let frag = vellum_collab::crdt::UpdateFragment::decode(snapshot).unwrap();
        doc.apply_update(&frag).unwrap();
    }
    for (_, bytes) in &loaded.fragments {
        let frag = vellum_collab::crdt::UpdateFragment::decode(bytes).unwrap();
        doc.apply_update(&frag).unwrap();
    }
    doc.elements().iter().map(|e| e.to_vec()).collect()
}

#[test]
fn test_reopen_before_compaction_replays_full_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let doc_id = Uuid::new_v4();
    let (fragments, expected) = edit_history();

    {
        let log = UpdateLog::open(StoreConfig::for_testing(&path)).unwrap();
        for frag in &fragments {
            log.append(doc_id, frag).unwrap();
        }
        // No compaction, no graceful shutdown.
    }

    let log = UpdateLog::open(StoreConfig::for_testing(&path)).unwrap();
    let loaded = log.load_latest(doc_id).unwrap();
    assert!(loaded.snapshot.is_none());
    assert_eq!(loaded.fragments.len(), fragments.len());
    assert_eq!(replay(&log, doc_id), expected);
}

#[test]
fn test_reopen_after_compaction_uses_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let doc_id = Uuid::new_v4();
    let (fragments, expected) = edit_history();

    {
        let log = UpdateLog::open(StoreConfig::for_testing(&path)).unwrap();
        let mut replica = DocState::new(99);
        for frag in &fragments {
            log.append(doc_id, frag).unwrap();
            let decoded = vellum_collab::crdt::UpdateFragment::decode(frag).unwrap();
            replica.apply_update(&decoded).unwrap();
        }
        let snapshot = replica.snapshot_fragment().encode().unwrap();
        log.compact(doc_id, &snapshot, fragments.len() as u64 - 1).unwrap();
    }

    let log = UpdateLog::open(StoreConfig::for_testing(&path)).unwrap();
    let loaded = log.load_latest(doc_id).unwrap();
    assert!(loaded.snapshot.is_some());
    assert!(loaded.fragments.is_empty(), "compacted fragments are gone");
    assert_eq!(replay(&log, doc_id), expected);
}

#[test]
fn test_pre_and_post_compaction_states_are_identical() {
    // The two legal crash outcomes — old log, or new snapshot — must
    // reconstruct the same document.
    let doc_id = Uuid::new_v4();
    let (fragments, expected) = edit_history();

    let dir_a = tempfile::tempdir().unwrap();
    let log_a = UpdateLog::open(StoreConfig::for_testing(dir_a.path().join("db"))).unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let log_b = UpdateLog::open(StoreConfig::for_testing(dir_b.path().join("db"))).unwrap();

    let mut replica = DocState::new(99);
    for frag in &fragments {
        log_a.append(doc_id, frag).unwrap();
        log_b.append(doc_id, frag).unwrap();
        let decoded = vellum_collab::crdt::UpdateFragment::decode(frag).unwrap();
        replica.apply_update(&decoded).unwrap();
    }
    let snapshot = replica.snapshot_fragment().encode().unwrap();
    log_b.compact(doc_id, &snapshot, fragments.len() as u64 - 1).unwrap();

    assert_eq!(replay(&log_a, doc_id), expected);
    assert_eq!(replay(&log_b, doc_id), expected);
}

#[test]
fn test_partial_compaction_keeps_tail_fragments() {
    let dir = tempfile::tempdir().unwrap();
    let doc_id = Uuid::new_v4();
    let (fragments, expected) = edit_history();

    let log = UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut replica = DocState::new(99);
    for (i, frag) in fragments.iter().enumerate() {
        log.append(doc_id, frag).unwrap();
        if i < 5 {
            let decoded = vellum_collab::crdt::UpdateFragment::decode(frag).unwrap();
            replica.apply_update(&decoded).unwrap();
        }
    }

    // Snapshot covers only the first five fragments.
    let snapshot = replica.snapshot_fragment().encode().unwrap();
    log.compact(doc_id, &snapshot, 4).unwrap();

    let loaded = log.load_latest(doc_id).unwrap();
    assert_eq!(loaded.fragments.len(), fragments.len() - 5);
    assert_eq!(loaded.fragments[0].0, 5);
    assert_eq!(replay(&log, doc_id), expected);
}

#[tokio::test]
async fn test_session_roundtrip_through_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let doc_id = Uuid::new_v4();
    let config = SessionConfig { compact_threshold: 4, ..SessionConfig::default() };

    let mut replica = DocState::new(7);
    {
        let session = DocumentSession::open(doc_id, store.clone(), config.clone())
            .await
            .unwrap();
        let conn = Uuid::new_v4();
        session.subscribe(conn).await.unwrap();
        for i in 0..9u8 {
            let frag = replica.push(vec![i]).unwrap();
            session
                .apply_remote(conn, frag.encode().unwrap())
                .await
                .unwrap();
        }
        session.flush().await.unwrap();
    }

    let meta = store.meta(doc_id).unwrap();
    assert!(meta.snapshot_seq.is_some());

    let session = DocumentSession::open(doc_id, store, SessionConfig::default())
        .await
        .unwrap();
    let elements = session.elements().await.unwrap();
    assert_eq!(elements.len(), 9);
    assert_eq!(
        elements,
        replica.elements().iter().map(|e| e.to_vec()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_unflushed_session_still_durable() {
    // Appends are durable as they happen; dropping the session without a
    // flush must not lose acknowledged updates.
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
        let frag = replica.push(b"acknowledged".to_vec()).unwrap();
        session
            .apply_remote(conn, frag.encode().unwrap())
            .await
            .unwrap();
        // Give the writer queue a beat to drain, then drop without flush.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    let session = DocumentSession::open(doc_id, store, SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(
        session.elements().await.unwrap(),
        vec![b"acknowledged".to_vec()]
    );
}
