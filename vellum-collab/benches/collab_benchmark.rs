use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

use vellum_collab::doc::{Step, SyncDoc};
use vellum_collab::server::DocumentInstance;
use vellum_collab::storage::{FileStore, PersistedDoc, SnapshotStore};
use vellum_collab::text::{TextDoc, TextStep};
use vellum_comms::{Envelope, MessageBus};

fn bench_step_encode(c: &mut Criterion) {
    let step = TextStep::insert(512, "collaborative");

    c.bench_function("step_encode", |b| {
        b.iter(|| {
            let bytes =
                bincode::serde::encode_to_vec(black_box(&step), bincode::config::standard())
                    .unwrap();
            black_box(bytes);
        })
    });
}

fn bench_step_decode(c: &mut Criterion) {
    let step = TextStep::insert(512, "collaborative");
    let encoded = bincode::serde::encode_to_vec(&step, bincode::config::standard()).unwrap();

    c.bench_function("step_decode", |b| {
        b.iter(|| {
            let (decoded, _): (TextStep, usize) =
                bincode::serde::decode_from_slice(black_box(&encoded), bincode::config::standard())
                    .unwrap();
            black_box(decoded);
        })
    });
}

fn bench_text_apply_insert(c: &mut Criterion) {
    let doc = TextDoc::new("lorem ipsum dolor sit amet ".repeat(400));
    let step = TextStep::insert(5_000, "x");

    c.bench_function("text_apply_insert_10KB", |b| {
        b.iter(|| {
            black_box(black_box(&doc).apply(&step).unwrap());
        })
    });
}

fn bench_step_invert(c: &mut Criterion) {
    let doc = TextDoc::new("abcdefghij".repeat(100));
    let step = TextStep::delete(&doc, 100, 200).unwrap();

    c.bench_function("step_invert_delete", |b| {
        b.iter(|| {
            black_box(black_box(&step).invert(&doc));
        })
    });
}

fn bench_bus_publish_unicast(c: &mut Criterion) {
    let bus: MessageBus<u64> = MessageBus::new();
    let hits = Arc::new(AtomicU64::new(0));
    let _subscription = bus.subscribe("peer", {
        let hits = Arc::clone(&hits);
        Arc::new(move |_envelope: &Arc<Envelope<u64>>| {
            hits.fetch_add(1, Ordering::Relaxed);
        })
    });

    c.bench_function("bus_publish_unicast", |b| {
        b.iter(|| {
            bus.publish(Envelope::ping("peer", "bench", black_box(7u64)));
        })
    });
    black_box(hits.load(Ordering::Relaxed));
}

fn bench_bus_broadcast_100_subscribers(c: &mut Criterion) {
    let bus: MessageBus<u64> = MessageBus::new();
    let hits = Arc::new(AtomicU64::new(0));
    let _subscriptions: Vec<_> = (0..100)
        .map(|i| {
            let hits = Arc::clone(&hits);
            bus.subscribe(
                format!("peer/{i}"),
                Arc::new(move |_envelope: &Arc<Envelope<u64>>| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            )
        })
        .collect();

    c.bench_function("bus_broadcast_100_subscribers", |b| {
        b.iter(|| {
            bus.publish(Envelope::broadcast("bench", black_box(7u64)));
        })
    });
    black_box(hits.load(Ordering::Relaxed));
}

fn bench_instance_apply_100_steps(c: &mut Criterion) {
    let client = Uuid::new_v4();

    c.bench_function("instance_apply_100_steps", |b| {
        b.iter(|| {
            let mut instance = DocumentInstance::new(
                "bench".to_string(),
                TextDoc::initial(),
                SystemTime::now(),
                1000,
            );
            for i in 0..100u64 {
                instance
                    .add_events(i, vec![TextStep::insert(i as usize, "x")], client)
                    .unwrap();
            }
            black_box(instance.version());
        })
    });
}

fn bench_instance_events_since(c: &mut Criterion) {
    let client = Uuid::new_v4();
    let mut instance = DocumentInstance::new(
        "bench".to_string(),
        TextDoc::initial(),
        SystemTime::now(),
        1000,
    );
    for i in 0..1000u64 {
        instance
            .add_events(i, vec![TextStep::insert(i as usize, "x")], client)
            .unwrap();
    }

    c.bench_function("instance_events_since_mid_history", |b| {
        b.iter(|| {
            black_box(instance.events_since(black_box(500)).unwrap());
        })
    });
}

fn bench_snapshot_save(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("vellum_bench_save_{}", Uuid::new_v4()));
    let store = FileStore::open(&dir).unwrap();
    let doc = TextDoc::new("design document body ".repeat(5_000));
    let snapshot = PersistedDoc::new(doc.to_persistable());

    c.bench_function("snapshot_save_100KB", |b| {
        b.iter(|| {
            store.save("bench", black_box(&snapshot)).unwrap();
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_snapshot_load(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("vellum_bench_load_{}", Uuid::new_v4()));
    let store = FileStore::open(&dir).unwrap();
    let doc = TextDoc::new("design document body ".repeat(5_000));
    store
        .save("bench", &PersistedDoc::new(doc.to_persistable()))
        .unwrap();

    c.bench_function("snapshot_load_100KB", |b| {
        b.iter(|| {
            black_box(store.load(black_box("bench")).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_step_encode,
    bench_step_decode,
    bench_text_apply_insert,
    bench_step_invert,
    bench_bus_publish_unicast,
    bench_bus_broadcast_100_subscribers,
    bench_instance_apply_100_steps,
    bench_instance_events_since,
    bench_snapshot_save,
    bench_snapshot_load,
);
criterion_main!(benches);
