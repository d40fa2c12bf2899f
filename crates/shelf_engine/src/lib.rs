//! # Shelf Engine
//!
//! Storage engine contract and implementations for Shelf.
//!
//! This crate is the lowest layer of Shelf. An engine is an **event-driven
//! object store** in the shape of IndexedDB: versioned databases holding
//! object stores and indexes, scoped transactions that commit on their own,
//! and cursors that step through records one callback at a time.
//!
//! ## Design Principles
//!
//! - Engines report outcomes through callbacks, never by blocking
//! - All callbacks of one engine run on a single event loop
//! - Records are JSON values; keys are [`Key`]s with the IndexedDB ordering
//! - Engines must be `Send + Sync` so async callers can share them
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - In-process engine for tests, tools and hosts
//!   without a native store
//! - [`UnavailableEngine`] - Stand-in that reports the engine as missing
//!
//! ## Example
//!
//! ```rust
//! use shelf_engine::{EngineFactory, MemoryEngine, OpenCallbacks, StoreParameters};
//! use std::sync::mpsc;
//!
//! let engine = MemoryEngine::new().unwrap();
//! let (tx, rx) = mpsc::channel();
//! let err_tx = tx.clone();
//! engine.open(
//!     "library",
//!     Some(1),
//!     OpenCallbacks::new(
//!         move |conn| tx.send(Ok(conn.object_store_names())).unwrap(),
//!         move |err| err_tx.send(Err(err)).unwrap(),
//!     )
//!     .on_upgrade_needed(|upgrade| {
//!         upgrade.create_object_store("books", &StoreParameters::default())
//!     }),
//! );
//! assert_eq!(rx.recv().unwrap().unwrap(), vec!["books".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod key;
mod memory;
mod types;
mod unavailable;

pub use engine::{
    BlockedCallback, CursorCallback, DatabasesCallback, DeleteCallbacks, EngineConnection,
    EngineCursor, EngineFactory, EngineTransaction, ErrorCallback, OpenCallbacks, RequestCallback,
    SuccessCallback, Task, TransactionCallbacks, UpgradeCallback, UpgradeContext,
    VersionChangeHandler,
};
pub use error::{EngineError, EngineResult};
pub use key::{Key, KeyPath, KeyRange};
pub use memory::MemoryEngine;
pub use types::{
    CursorDirection, DatabaseInfo, IndexParameters, RequestOutput, RequestTarget, StoreParameters,
    StoreRequest, TransactionMode, VersionChange,
};
pub use unavailable::UnavailableEngine;
