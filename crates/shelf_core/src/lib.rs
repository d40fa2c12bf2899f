//! # Shelf Core
//!
//! Async database façade for Shelf.
//!
//! This crate provides:
//! - Connection opening with versioned, additive schema migration
//! - Transactions as futures: one engine transaction, one outcome
//! - Record operations (single, bulk, index and cursor based)
//! - A registry of named databases with a default and a selection
//!
//! Storage itself lives behind [`shelf_engine::EngineFactory`]; any engine
//! works, [`MemoryEngine`] is bundled.
//!
//! ## Example
//!
//! ```rust
//! use shelf_core::{DatabaseConfig, IndexSchema, MemoryEngine, Shelf, StoreSchema};
//! use serde_json::{json, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let shelf = Shelf::builder()
//!     .engine(MemoryEngine::new()?)
//!     .database(
//!         DatabaseConfig::new("library", 1).store(
//!             StoreSchema::new("books")
//!                 .key_path("isbn")
//!                 .index(IndexSchema::new("author", "author")),
//!         ),
//!     )
//!     .build()
//!     .await?;
//!
//! let db = shelf.database(Some("library"))?;
//! db.add("books", &json!({ "isbn": "0-00", "author": "Le Guin" })).await?;
//! let book: Option<Value> = db.get_by_index("books", "author", "Le Guin").await?;
//! assert_eq!(book.unwrap()["isbn"], "0-00");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod cursor;
mod database;
mod error;
mod migration;
mod registry;
mod shelf;
mod transaction;

pub use config::{DatabaseConfig, IndexSchema, StoreSchema};
pub use connection::{Connection, ConnectionOpener};
pub use cursor::{CursorAction, CursorEntry, CursorQuery, CursorStream, IndexKey};
pub use database::{Database, Keyed, Record};
pub use error::{CoreError, CoreResult};
pub use migration::{
    MigrationContext, MigrationFactory, MigrationOperation, MigrationReport, MigrationStep,
    MigrationSteps, SchemaMigrator, UpgradePlan,
};
pub use registry::Registry;
pub use shelf::{Shelf, ShelfBuilder};
pub use transaction::{
    stream_transaction, with_transaction, Emitter, Outcome, Phase, TransactionScope,
    TransactionStream,
};

pub use shelf_engine::{
    CursorDirection, DatabaseInfo, EngineError, EngineFactory, Key, KeyPath, KeyRange,
    MemoryEngine, RequestOutput, RequestTarget, StoreRequest, TransactionMode, UnavailableEngine,
};
