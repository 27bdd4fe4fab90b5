use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mantisdb_binding::{
    Context, ContextOptions, MemoryEngine, Object, ObjectOptions, ShutdownCoordinator, Table, TableKind,
};
use std::sync::Arc;
use std::thread;

fn new_context() -> Context {
    Context::new(
        Arc::new(MemoryEngine::new()),
        ShutdownCoordinator::new(),
        ContextOptions::default(),
    )
    .unwrap()
}

fn hash_options() -> ObjectOptions {
    ObjectOptions::table(TableKind::Hash).key_type("ShortText")
}

fn bench_open_close(c: &mut Criterion) {
    let mut group = c.benchmark_group("open_close");

    for size in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let context = new_context();
            let options = hash_options();
            b.iter(|| {
                for _ in 0..size {
                    let table = Table::create(&context, &options).unwrap();
                    table.close().unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_open_drop(c: &mut Criterion) {
    let mut group = c.benchmark_group("open_drop");

    for size in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let context = new_context();
            let options = hash_options();
            b.iter(|| {
                for _ in 0..size {
                    black_box(Table::create(&context, &options).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_context_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("context_sweep");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let options = hash_options();
            b.iter(|| {
                let context = new_context();
                let floating: Vec<Object> = (0..size)
                    .map(|_| Object::open(&context, &options).unwrap())
                    .collect();
                context.close();
                black_box(floating);
            });
        });
    }
    group.finish();
}

fn bench_lookup_shared(c: &mut Criterion) {
    let context = new_context();
    let short_text = context.lookup("ShortText").unwrap().unwrap();

    c.bench_function("lookup_shared", |b| {
        b.iter(|| black_box(context.lookup("ShortText").unwrap()));
    });
    drop(short_text);
}

fn bench_concurrent_contexts(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_contexts");

    for threads in [2, 4, 8].iter() {
        group.throughput(Throughput::Elements(100 * *threads as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                let engine = Arc::new(MemoryEngine::new());
                let shutdown = ShutdownCoordinator::new();
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let engine = Arc::clone(&engine);
                            let shutdown = Arc::clone(&shutdown);
                            thread::spawn(move || {
                                let context =
                                    Context::new(engine, shutdown, ContextOptions::default()).unwrap();
                                for i in 0..100 {
                                    let table = Table::create(&context, &hash_options()).unwrap();
                                    table.add(&format!("key_{}", i)).unwrap();
                                }
                                context.close();
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_open_close,
    bench_open_drop,
    bench_context_sweep,
    bench_lookup_shared,
    bench_concurrent_contexts
);
criterion_main!(benches);
