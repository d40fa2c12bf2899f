//! Test fixtures and shelf helpers.
//!
//! Provides record types, database configurations and ready-made shelves
//! for common test scenarios.

use serde::{Deserialize, Serialize};
use shelf_core::{
    Database, DatabaseConfig, EngineFactory, IndexSchema, MemoryEngine, Shelf, StoreSchema,
};
use std::sync::Arc;

/// A record of the `people` store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Primary key, generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Display name.
    pub name: String,
    /// Unique email address.
    pub email: String,
}

impl Person {
    /// A person without an id.
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    /// A numbered person with a unique email.
    pub fn numbered(n: usize) -> Self {
        Self::new(&format!("person {n}"), &format!("person{n}@example.com"))
    }
}

/// A record of the `cars` store, keyed by plate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    /// Primary key.
    pub plate: String,
    /// Manufacturer.
    pub make: String,
    /// Owner ids.
    #[serde(default)]
    pub owners: Vec<u32>,
}

impl Car {
    /// A car without owners.
    pub fn new(plate: &str, make: &str) -> Self {
        Self {
            plate: plate.to_string(),
            make: make.to_string(),
            owners: Vec::new(),
        }
    }
}

/// `people` with an auto-increment `id` key, a `name` index and a unique
/// `email` index.
pub fn people_store() -> StoreSchema {
    StoreSchema::new("people")
        .key_path("id")
        .auto_increment(true)
        .index(IndexSchema::new("name", "name"))
        .index(IndexSchema::new("email", "email").unique(true))
}

/// `cars` keyed by `plate`, with a `make` index and a multi-entry
/// `owners` index.
pub fn cars_store() -> StoreSchema {
    StoreSchema::new("cars")
        .key_path("plate")
        .index(IndexSchema::new("make", "make"))
        .index(IndexSchema::new("owners", "owners").multi_entry(true))
}

/// `MyDb` at version 1 with the `people` store.
pub fn people_config() -> DatabaseConfig {
    DatabaseConfig::new("MyDb", 1).store(people_store())
}

/// `garage` at version 1 with the `cars` store.
pub fn garage_config() -> DatabaseConfig {
    DatabaseConfig::new("garage", 1).store(cars_store())
}

/// A shelf on a fresh in-memory engine.
///
/// Keeps the engine handle so tests can open raw connections next to the
/// shelf's own.
pub struct TestShelf {
    /// The shelf.
    pub shelf: Shelf,
    /// The engine under the shelf.
    pub engine: Arc<dyn EngineFactory>,
}

impl TestShelf {
    /// Builds a shelf with `configs` on a fresh memory engine.
    pub async fn with(configs: impl IntoIterator<Item = DatabaseConfig>) -> Self {
        let engine: Arc<dyn EngineFactory> =
            Arc::new(MemoryEngine::new().expect("Failed to start memory engine"));
        let mut builder = Shelf::builder().shared_engine(Arc::clone(&engine));
        for config in configs {
            builder = builder.database(config);
        }
        let shelf = builder.build().await.expect("Failed to build shelf");
        Self { shelf, engine }
    }

    /// A shelf holding only `MyDb`.
    pub async fn people() -> Self {
        Self::with([people_config()]).await
    }

    /// The façade of `name`, or of the default database.
    pub fn db(&self, name: Option<&str>) -> Database {
        self.shelf.database(name).expect("Database is not declared")
    }
}

impl std::ops::Deref for TestShelf {
    type Target = Shelf;

    fn deref(&self) -> &Self::Target {
        &self.shelf
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A `MyDb` shelf whose `people` store holds `count` numbered people
    /// with ids `1..=count`.
    pub async fn populated_people(count: usize) -> TestShelf {
        let test_shelf = TestShelf::people().await;
        let people: Vec<Person> = (1..=count).map(Person::numbered).collect();
        test_shelf
            .db(None)
            .bulk_add("people", &people)
            .await
            .expect("Failed to add people");
        test_shelf
    }

    /// A shelf with both `MyDb` (the default) and `garage`.
    pub async fn people_and_garage() -> TestShelf {
        TestShelf::with([people_config().default_database(true), garage_config()]).await
    }
}
