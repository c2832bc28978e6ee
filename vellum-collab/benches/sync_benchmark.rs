use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;
use vellum_collab::crdt::{DocState, StateVector};
use vellum_collab::protocol::SyncMessage;
use vellum_collab::storage::{StoreConfig, UpdateLog};

fn bench_local_insert(c: &mut Criterion) {
    c.bench_function("local_insert_1k_elements", |b| {
        b.iter(|| {
            let mut doc = DocState::new(1);
            for i in 0..1000u32 {
                doc.push(black_box(i.to_le_bytes().to_vec())).unwrap();
            }
            black_box(doc.len());
        })
    });
}

fn bench_merge_remote_fragments(c: &mut Criterion) {
    // Pre-build 1000 single-element fragments from one writer.
    let mut source = DocState::new(1);
    let fragments: Vec<_> = (0..1000u32)
        .map(|i| source.push(i.to_le_bytes().to_vec()).unwrap())
        .collect();

    c.bench_function("merge_1k_fragments", |b| {
        b.iter(|| {
            let mut replica = DocState::new(2);
            for frag in &fragments {
                replica.apply_update(black_box(frag)).unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_diff_computation(c: &mut Criterion) {
    let mut doc = DocState::new(1);
    for i in 0..1000u32 {
        doc.push(i.to_le_bytes().to_vec()).unwrap();
    }
    let empty = StateVector::new();
    let full = doc.state_vector();

    c.bench_function("diff_cold_peer_1k", |b| {
        b.iter(|| black_box(doc.diff(black_box(&empty))))
    });
    c.bench_function("diff_synced_peer_1k", |b| {
        b.iter(|| black_box(doc.diff(black_box(&full))))
    });
}

fn bench_fragment_encode_decode(c: &mut Criterion) {
    let mut doc = DocState::new(1);
    let frag = doc.push(vec![0u8; 64]).unwrap();
    let encoded = frag.encode().unwrap();

    c.bench_function("fragment_encode_64B", |b| {
        b.iter(|| black_box(frag.encode().unwrap()))
    });
    c.bench_function("fragment_decode_64B", |b| {
        b.iter(|| {
            black_box(vellum_collab::crdt::UpdateFragment::decode(black_box(&encoded)).unwrap())
        })
    });
}

fn bench_protocol_frame_roundtrip(c: &mut Criterion) {
    let msg = SyncMessage::Update { update: vec![0u8; 64] };
    let encoded = msg.encode();

    c.bench_function("frame_roundtrip_64B", |b| {
        b.iter(|| {
            let encoded = black_box(&msg).encode();
            black_box(SyncMessage::decode(&encoded).unwrap());
        })
    });
    c.bench_function("frame_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let log = UpdateLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc_id = Uuid::new_v4();
    let fragment = vec![0u8; 256];

    c.bench_function("log_append_256B", |b| {
        b.iter(|| {
            black_box(log.append(black_box(doc_id), black_box(&fragment)).unwrap());
        })
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let mut doc = DocState::new(1);
    for i in 0..1000u32 {
        doc.push(i.to_le_bytes().to_vec()).unwrap();
    }

    c.bench_function("snapshot_encode_1k", |b| {
        b.iter(|| black_box(doc.snapshot_fragment().encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_merge_remote_fragments,
    bench_diff_computation,
    bench_fragment_encode_decode,
    bench_protocol_frame_roundtrip,
    bench_log_append,
    bench_snapshot_encode,
);
criterion_main!(benches);
