//! Stress tests for Shelf.
//!
//! These helpers drive a `notes` store (see
//! [`crate::integration::notes_config`]) under heavy load and concurrent
//! access.

use crate::integration::Note;
use futures::future::join_all;
use shelf_core::{
    with_transaction, CoreError, Database, Outcome, RequestTarget, StoreRequest, TransactionMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent tasks (for concurrent tests).
    pub tasks: usize,
    /// Length of each record's payload.
    pub record_size: usize,
    /// Number of distinct records.
    pub record_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            tasks: 4,
            record_size: 256,
            record_count: 1_000,
        }
    }
}

fn note(id: usize, config: &StressConfig) -> Note {
    Note {
        id: (id % config.record_count) as u32,
        note: "x".repeat(config.record_size),
    }
}

async fn populate(db: &Database, config: &StressConfig) {
    let notes: Vec<Note> = (0..config.record_count).map(|i| note(i, config)).collect();
    db.bulk_put("notes", &notes)
        .await
        .expect("Failed to populate store");
}

/// Run a sequential write stress test.
pub async fn stress_sequential_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match db.update("notes", &note(i, config)).await {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a sequential read stress test.
pub async fn stress_sequential_reads(db: &Database, config: &StressConfig) -> StressTestResult {
    populate(db, config).await;

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let id = (i % config.record_count) as u32;
        match db.get_by_key::<Note>("notes", id).await {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a mixed read/write stress test.
pub async fn stress_mixed_operations(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let record = note(i, config);
        let result = match i % 3 {
            0 => db.update("notes", &record).await.map(|_| ()),
            1 => db.get_by_key::<Note>("notes", record.id).await.map(|_| ()),
            _ => db.delete("notes", record.id).await,
        };

        match result {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a concurrent read stress test on the current tokio runtime.
pub async fn stress_concurrent_reads(db: Database, config: &StressConfig) -> StressTestResult {
    populate(&db, config).await;

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_task = config.operations / config.tasks;

    let start = Instant::now();

    let handles: Vec<_> = (0..config.tasks)
        .map(|t| {
            let db = db.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let record_count = config.record_count;

            tokio::spawn(async move {
                for i in 0..ops_per_task {
                    let id = ((t * ops_per_task + i) % record_count) as u32;
                    match db.get_by_key::<Note>("notes", id).await {
                        Ok(_) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in join_all(handles).await {
        handle.expect("Task panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a transaction abort stress test. Every other transaction fails on
/// purpose after issuing its write.
pub async fn stress_transaction_aborts(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let conn = match db.connect().await {
            Ok(conn) => conn,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        let value = serde_json::to_value(note(i, config)).expect("Failed to encode note");
        let should_fail = i % 2 == 0;

        let result = with_transaction(
            &conn,
            &["notes"],
            TransactionMode::ReadWrite,
            move |scope, outcome: &Outcome<()>| {
                scope.request(
                    RequestTarget::store("notes"),
                    StoreRequest::Put { value, key: None },
                    |_| Ok(()),
                )?;
                if should_fail {
                    Err(CoreError::config("intentional"))
                } else {
                    outcome.set(());
                    Ok(())
                }
            },
        )
        .await;

        match result {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a large transaction stress test.
pub async fn stress_large_transactions(db: &Database, config: &StressConfig) -> StressTestResult {
    let batch_size = 100;

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for batch in 0..(config.operations / batch_size) {
        let notes: Vec<Note> = (0..batch_size)
            .map(|i| note(batch * batch_size + i, config))
            .collect();

        match db.bulk_put("notes", &notes).await {
            Ok(_) => successful += batch_size,
            Err(_) => failed += batch_size,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::notes_config;
    use crate::fixtures::TestShelf;

    async fn create_test_db() -> (TestShelf, Database) {
        let test_shelf = TestShelf::with([notes_config()]).await;
        let db = test_shelf.db(None);
        (test_shelf, db)
    }

    #[tokio::test]
    async fn test_sequential_writes() {
        let (_shelf, db) = create_test_db().await;
        let config = StressConfig {
            operations: 200,
            record_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_writes(&db, &config).await;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
    }

    #[tokio::test]
    async fn test_sequential_reads() {
        let (_shelf, db) = create_test_db().await;
        let config = StressConfig {
            operations: 200,
            record_count: 50,
            record_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_reads(&db, &config).await;
        assert_eq!(result.failed_ops, 0);
    }

    #[tokio::test]
    async fn test_mixed_operations() {
        let (_shelf, db) = create_test_db().await;
        let config = StressConfig {
            operations: 300,
            record_count: 50,
            record_size: 64,
            ..Default::default()
        };

        let result = stress_mixed_operations(&db, &config).await;
        assert_eq!(result.failed_ops, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads() {
        let (_shelf, db) = create_test_db().await;
        let config = StressConfig {
            operations: 400,
            tasks: 4,
            record_count: 50,
            record_size: 64,
        };

        let result = stress_concurrent_reads(db, &config).await;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);
    }

    #[tokio::test]
    async fn test_transaction_aborts() {
        let (_shelf, db) = create_test_db().await;
        let config = StressConfig {
            operations: 100,
            record_size: 64,
            ..Default::default()
        };

        let result = stress_transaction_aborts(&db, &config).await;
        // Half should succeed, half should fail (intentionally)
        assert_eq!(result.successful_ops, 50);
        assert_eq!(result.failed_ops, 50);
        assert_eq!(db.count("notes", None).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_large_transactions() {
        let (_shelf, db) = create_test_db().await;
        let config = StressConfig {
            operations: 1_000,
            record_size: 64,
            ..Default::default()
        };

        let result = stress_large_transactions(&db, &config).await;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(db.count("notes", None).await.unwrap(), 1_000);
    }
}
