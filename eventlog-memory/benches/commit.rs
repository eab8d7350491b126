use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventlog::{
    Event, EventId, EventStore, EventType, Events, ExpectedVersion, StreamName,
};
use eventlog_memory::InMemoryEventStore;
use futures::TryStreamExt;
use tokio::runtime::Runtime;

fn ready_store(rt: &Runtime) -> Arc<InMemoryEventStore> {
    let store = InMemoryEventStore::new();
    let _ = rt.block_on(store.setup()).expect("setup succeeds");
    Arc::new(store)
}

fn fresh_stream(prefix: &str) -> StreamName {
    StreamName::try_new(format!("{prefix}-{}", EventId::create())).expect("valid stream name")
}

fn events(size: u64) -> Events {
    let event_type = EventType::try_new("Bench:Recorded").expect("valid event type");
    let events = (0..size)
        .map(|i| Event::new(event_type.clone(), format!("test event {i}")))
        .collect();
    Events::try_from(events).expect("non-empty batch")
}

/// Benchmark single event commits to fresh streams
fn bench_single_event_commits(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let store = ready_store(&rt);

    let mut group = c.benchmark_group("single_event_commits");
    group.throughput(Throughput::Elements(1));

    group.bench_function("commit_single_event", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                store
                    .commit(fresh_stream("single"), events(1), ExpectedVersion::NoStream)
                    .await
                    .expect("commit succeeds"),
            )
        });
    });

    group.finish();
}

/// Benchmark batch commits
fn bench_batch_commits(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let store = ready_store(&rt);

    let mut group = c.benchmark_group("batch_commits");

    for batch_size in [10, 50, 100, 500] {
        group.throughput(Throughput::Elements(batch_size));

        group.bench_with_input(
            BenchmarkId::new("commit_batch", batch_size),
            &batch_size,
            |b, &size| {
                b.to_async(&rt).iter(|| async {
                    black_box(
                        store
                            .commit(fresh_stream("batch"), events(size), ExpectedVersion::NoStream)
                            .await
                            .expect("commit succeeds"),
                    )
                });
            },
        );
    }
    group.finish();
}

/// Benchmark paged reads of one stream
fn bench_stream_loads(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let store = ready_store(&rt);

    let mut group = c.benchmark_group("stream_loads");

    for stream_len in [10, 100, 1000] {
        let stream = fresh_stream("load");
        let _ = rt
            .block_on(store.commit(stream.clone(), events(stream_len), ExpectedVersion::NoStream))
            .expect("commit succeeds");
        group.throughput(Throughput::Elements(stream_len));

        group.bench_with_input(
            BenchmarkId::new("load_stream", stream_len),
            &stream,
            |b, stream| {
                b.to_async(&rt).iter(|| async {
                    let loaded: Vec<_> = store
                        .load(stream.clone(), None)
                        .try_collect()
                        .await
                        .expect("load succeeds");
                    black_box(loaded)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_single_event_commits,
    bench_batch_commits,
    bench_stream_loads
);
criterion_main!(benches);
