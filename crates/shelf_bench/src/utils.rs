//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use shelf_core::{Database, DatabaseConfig, IndexSchema, MemoryEngine, Shelf, StoreSchema};
use tokio::runtime::Runtime;

/// Generate a random alphanumeric payload of the specified length.
pub fn random_payload(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// Generate records without keys, each with a `group` field cycling
/// through `groups` values and a payload of `payload_size` characters.
pub fn generate_records(count: usize, payload_size: usize, groups: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "group": i % groups.max(1),
                "payload": random_payload(payload_size),
            })
        })
        .collect()
}

/// A runtime for driving async operations from benchmark loops.
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

/// A `bench` database with an auto-increment `records` store indexed by
/// `group`, on a fresh memory engine.
pub fn bench_database(rt: &Runtime) -> Database {
    rt.block_on(async {
        let shelf = Shelf::builder()
            .engine(MemoryEngine::new().expect("Failed to start engine"))
            .database(
                DatabaseConfig::new("bench", 1).store(
                    StoreSchema::new("records")
                        .key_path("id")
                        .auto_increment(true)
                        .index(IndexSchema::new("group", "group")),
                ),
            )
            .build()
            .await
            .expect("Failed to build shelf");
        shelf.database(None).expect("Database is declared")
    })
}
