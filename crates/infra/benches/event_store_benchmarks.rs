use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use eventvault_core::{Aggregate, AggregateVersion, Command, SearchQuery, UniqueConstraint};
use eventvault_events::{EventMapperRegistry, Notifier, ReadModel};
use eventvault_infra::{EventStore, EventStoreConfig, InMemoryStore};
use serde_json::{json, Value};
use tokio::runtime::{Builder, Runtime};

fn runtime() -> Runtime {
    Builder::new_current_thread().enable_time().build().unwrap()
}

fn engine() -> EventStore<InMemoryStore, Value> {
    let mappers = EventMapperRegistry::new();
    mappers.register_json("item", "item.adjusted", |payload: Value| payload);
    EventStore::new(
        InMemoryStore::new(),
        Arc::new(mappers),
        Arc::new(Notifier::new()),
        EventStoreConfig::default(),
    )
}

fn adjust(id: &str, delta: i64) -> Command {
    Command::new(
        Aggregate::new("bench", "item", AggregateVersion::default(), id, "org"),
        "item.adjusted",
    )
    .payload(json!({ "delta": delta }))
}

fn bench_push_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("push_latency");

    group.bench_function("single_event_existing_stream", |b| {
        let es = engine();
        rt.block_on(es.push(vec![adjust("i1", 0)])).unwrap();
        b.iter(|| rt.block_on(es.push(vec![adjust("i1", black_box(5))])).unwrap());
    });

    // Every iteration claims a fresh value.
    group.bench_function("single_event_with_unique_constraint", |b| {
        let es = engine();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let cmd = adjust("i1", 1).unique_constraint(UniqueConstraint::add("sku", n.to_string(), "sku in use"));
            rt.block_on(es.push(vec![cmd])).unwrap()
        });
    });

    group.finish();
}

fn bench_push_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("push_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &size| {
            let es = engine();
            b.iter(|| {
                let commands = (0..size).map(|i| adjust("i1", i as i64)).collect();
                black_box(rt.block_on(es.push(commands)).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_reduce(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reduce");

    for history in [10usize, 100, 1000] {
        let es = engine();
        let commands: Vec<Command> = (0..history).map(|i| adjust("i1", i as i64)).collect();
        rt.block_on(es.push(commands)).unwrap();
        let query = SearchQuery::for_stream(&adjust("i1", 0).aggregate.stream_key());

        group.throughput(Throughput::Elements(history as u64));
        group.bench_with_input(BenchmarkId::new("read_model", history), &history, |b, _| {
            b.iter(|| {
                let mut model = ReadModel::<Value>::new();
                rt.block_on(es.reduce(&query, &mut model)).unwrap();
                black_box(model.sequence)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push_latency, bench_push_throughput, bench_reduce);
criterion_main!(benches);
