//! Memory engine benchmarks, driving the callback interface directly.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use shelf_engine::{
    EngineConnection, EngineFactory, EngineResult, KeyPath, MemoryEngine, OpenCallbacks,
    RequestOutput, RequestTarget, StoreParameters, StoreRequest, TransactionCallbacks,
    TransactionMode,
};
use std::sync::mpsc;
use std::sync::Arc;

fn open_engine() -> (MemoryEngine, Arc<dyn EngineConnection>) {
    let engine = MemoryEngine::new().unwrap();
    let (tx, rx) = mpsc::channel();
    let err_tx = tx.clone();
    engine.open(
        "bench",
        Some(1),
        OpenCallbacks::new(
            move |conn| tx.send(Ok(conn)).unwrap(),
            move |err| err_tx.send(Err(err)).unwrap(),
        )
        .on_upgrade_needed(|ctx| {
            ctx.create_object_store(
                "records",
                &StoreParameters {
                    key_path: Some(KeyPath::single("id")),
                    auto_increment: false,
                },
            )
        }),
    );
    let conn = rx.recv().unwrap().unwrap();
    (engine, conn)
}

/// Runs one read-write transaction issuing `requests` and waits for it to
/// settle.
fn run_transaction(conn: &Arc<dyn EngineConnection>, requests: Vec<StoreRequest>) {
    let (tx, rx) = mpsc::channel();
    let task_conn = Arc::clone(conn);
    conn.dispatch(Box::new(move || {
        let abort_tx = tx.clone();
        let txn = task_conn
            .transaction(
                &["records".to_string()],
                TransactionMode::ReadWrite,
                TransactionCallbacks::new(
                    move || tx.send(Ok(())).unwrap(),
                    move |err| abort_tx.send(Err(err)).unwrap(),
                ),
            )
            .unwrap();
        for request in requests {
            txn.request(
                RequestTarget::store("records"),
                request,
                Box::new(|_: EngineResult<RequestOutput>| {}),
            )
            .unwrap();
        }
    }));
    rx.recv().unwrap().unwrap();
}

/// Benchmark put transactions of varying size.
fn bench_put_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_put");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let (_engine, conn) = open_engine();

                b.iter(|| {
                    let requests = (0..batch_size)
                        .map(|i| StoreRequest::Put {
                            value: json!({ "id": i, "payload": "x".repeat(64) }),
                            key: None,
                        })
                        .collect();
                    run_transaction(&conn, black_box(requests));
                });
            },
        );
    }
    group.finish();
}

/// Benchmark count requests against a populated store.
fn bench_count_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_count");

    for count in [100, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let (_engine, conn) = open_engine();
            run_transaction(
                &conn,
                (0..count)
                    .map(|i| StoreRequest::Put {
                        value: json!({ "id": i }),
                        key: None,
                    })
                    .collect(),
            );

            b.iter(|| run_transaction(&conn, vec![StoreRequest::Count(None)]));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put_transaction, bench_count_request);

criterion_main!(benches);
