use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scribe_collab::broadcast::{AcceptedOperation, BroadcastGroup};
use scribe_collab::config::EngineConfig;
use scribe_collab::manager::SessionManager;
use scribe_collab::protocol::{Participant, SyncMessage};
use scribe_collab::storage::{DocumentStore, LogEntry, MemoryLog, OperationLog, StoreConfig};
use scribe_collab::OfflineQueue;
use scribe_ot::{ContentHash, Operation};
use std::sync::Arc;
use uuid::Uuid;

fn single_char_submit() -> SyncMessage {
    SyncMessage::Submit {
        document_id: Uuid::new_v4(),
        operation: Operation::insert_at(42, "bench-author", 1_000, 500, "x"),
    }
}

fn bench_submit_encode(c: &mut Criterion) {
    let msg = single_char_submit();

    c.bench_function("submit_encode_1char", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_submit_decode(c: &mut Criterion) {
    let encoded = single_char_submit().encode().unwrap();

    c.bench_function("submit_decode_1char", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_broadcast_1000_ops_100_participants(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let doc = Uuid::new_v4();
    let ops: Vec<Arc<AcceptedOperation>> = (1..=1000u64)
        .map(|version| {
            Arc::new(AcceptedOperation {
                document_id: doc,
                version,
                operation: Operation::insert_at(version - 1, "writer", 0, 0, "x"),
                content_hash: ContentHash::of("x"),
            })
        })
        .collect();

    c.bench_function("broadcast_1000_ops_100_participants", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(doc, 2048);
                let mut feeds = Vec::new();
                for i in 0..100 {
                    let participant = Participant::new(format!("reader-{i}"), format!("Reader {i}"));
                    feeds.push(group.add_participant(participant, 0).await);
                }
                for op in &ops {
                    black_box(group.publish(op.clone()));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    let op = Operation::insert_at(0, "offline", 0, 0, "x");

    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for _ in 0..1000 {
                queue.enqueue(op.clone());
            }
            black_box(queue.drain());
        })
    });
}

fn bench_submit_memory_log(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = SessionManager::in_memory(EngineConfig::default());
    let doc = Uuid::new_v4();
    let mut version = 0u64;

    c.bench_function("submit_memory_log", |b| {
        b.iter(|| {
            let op = Operation::insert_at(version, "typist", version as usize, version as usize, "k");
            let ack = rt.block_on(engine.submit(doc, op)).unwrap();
            version = ack.version;
            black_box(ack);
        })
    });

    rt.block_on(engine.shutdown());
}

fn bench_memory_log_append(c: &mut Criterion) {
    let log = MemoryLog::new();
    let doc = Uuid::new_v4();
    let mut version = 0u64;

    c.bench_function("memory_log_append", |b| {
        b.iter(|| {
            version += 1;
            let entry = LogEntry {
                version,
                operation: Operation::insert_at(version - 1, "typist", 0, 0, "k"),
                content_hash: ContentHash::of("k"),
            };
            log.append(black_box(doc), black_box(&entry)).unwrap();
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_store_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("scribe_bench_append_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::at(dir.clone())).unwrap();
    let doc = Uuid::new_v4();
    let mut version = 0u64;

    c.bench_function("store_append_1char", |b| {
        b.iter(|| {
            version += 1;
            let entry = LogEntry {
                version,
                operation: Operation::insert_at(version - 1, "typist", 0, 0, "k"),
                content_hash: ContentHash::of("k"),
            };
            store.append(black_box(doc), black_box(&entry)).unwrap();
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_read_page(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("scribe_bench_read_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::at(dir.clone())).unwrap();
    let doc = Uuid::new_v4();
    for version in 1..=1000u64 {
        let entry = LogEntry {
            version,
            operation: Operation::insert_at(version - 1, "typist", 0, 0, "k"),
            content_hash: ContentHash::of("k"),
        };
        store.append(doc, &entry).unwrap();
    }

    c.bench_function("store_read_page_100", |b| {
        b.iter(|| black_box(store.read_page(doc, black_box(451), 550, 100).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_submit_encode,
    bench_submit_decode,
    bench_broadcast_1000_ops_100_participants,
    bench_offline_queue,
    bench_submit_memory_log,
    bench_memory_log_append,
    bench_store_append,
    bench_store_read_page,
);
criterion_main!(benches);
