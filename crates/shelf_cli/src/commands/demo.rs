//! Demo command implementation.

use super::check_format;
use serde::{Deserialize, Serialize};
use shelf_core::{DatabaseConfig, IndexSchema, MemoryEngine, Shelf, StoreSchema};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    name: String,
    email: String,
}

/// Counts observed during the demo.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoResult {
    /// People added.
    pub added: usize,
    /// Keys generated for them, in order.
    pub keys: Vec<String>,
    /// Records read back with `get_all`.
    pub read_back: usize,
    /// Count before clearing.
    pub count_before_clear: usize,
    /// Count after clearing.
    pub count_after_clear: usize,
    /// Wall time in milliseconds.
    pub elapsed_ms: u128,
}

/// Runs the demo command.
pub async fn run(people: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    check_format(format)?;
    let start = Instant::now();

    let shelf = Shelf::builder()
        .engine(MemoryEngine::new()?)
        .database(
            DatabaseConfig::new("MyDb", 1).store(
                StoreSchema::new("people")
                    .key_path("id")
                    .auto_increment(true)
                    .index(IndexSchema::new("email", "email").unique(true)),
            ),
        )
        .build()
        .await?;
    let db = shelf.database(None)?;

    let batch: Vec<Person> = (1..=people)
        .map(|n| Person {
            id: None,
            name: format!("Person {n}"),
            email: format!("person{n}@example.com"),
        })
        .collect();
    let keys = db.bulk_add("people", &batch).await?;
    debug!(added = keys.len(), "people added");

    let everyone: Vec<Person> = db.get_all("people").await?;
    let count_before_clear = db.count("people", None).await?;
    db.clear("people").await?;
    let count_after_clear = db.count("people", None).await?;

    let result = DemoResult {
        added: batch.len(),
        keys: keys.iter().map(ToString::to_string).collect(),
        read_back: everyone.len(),
        count_before_clear,
        count_after_clear,
        elapsed_ms: start.elapsed().as_millis(),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Shelf Demo");
        println!("==========");
        println!();
        println!("Added:          {} ({})", result.added, result.keys.join(", "));
        println!("Read back:      {}", result.read_back);
        println!("Before clear:   {}", result.count_before_clear);
        println!("After clear:    {}", result.count_after_clear);
        println!("Elapsed:        {} ms", result.elapsed_ms);
    }

    Ok(())
}
