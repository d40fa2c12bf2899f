//! Storage engine contract.
//!
//! An engine is an event-driven object store. Every operation reports its
//! outcome through callbacks that the engine invokes from its own event
//! loop; nothing blocks and nothing returns a future. Callers that want
//! futures translate the callbacks themselves.

use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use crate::types::{
    CursorDirection, DatabaseInfo, IndexParameters, RequestOutput, RequestTarget, StoreParameters,
    StoreRequest, TransactionMode, VersionChange,
};
use serde_json::Value;
use std::sync::Arc;

/// Work to run on the engine's event loop.
pub type Task = Box<dyn FnOnce() + Send>;

/// Receives the connection of a successful open.
pub type SuccessCallback = Box<dyn FnOnce(Arc<dyn EngineConnection>) + Send>;

/// Receives the error of a failed operation.
pub type ErrorCallback = Box<dyn FnOnce(EngineError) + Send>;

/// Runs schema changes during a version upgrade.
///
/// Returning an error aborts the upgrade.
pub type UpgradeCallback = Box<dyn FnOnce(&dyn UpgradeContext) -> EngineResult<()> + Send>;

/// Notified when other connections keep an upgrade or deletion waiting.
pub type BlockedCallback = Box<dyn FnOnce(VersionChange) + Send>;

/// Notified when another party wants to upgrade or delete the database.
pub type VersionChangeHandler = Box<dyn FnMut(VersionChange) + Send>;

/// Receives the result of a single request.
pub type RequestCallback = Box<dyn FnOnce(EngineResult<RequestOutput>) + Send>;

/// Receives each cursor step; `None` marks the end of the iteration.
pub type CursorCallback = Box<dyn FnMut(EngineResult<Option<&dyn EngineCursor>>) + Send>;

/// Receives the list of stored databases.
pub type DatabasesCallback = Box<dyn FnOnce(EngineResult<Vec<DatabaseInfo>>) + Send>;

/// Callbacks of an open request.
pub struct OpenCallbacks {
    /// Fired before success when the requested version is higher.
    pub on_upgrade_needed: Option<UpgradeCallback>,
    /// Fired when other connections stay open.
    pub on_blocked: Option<BlockedCallback>,
    /// Fired with the open connection.
    pub on_success: SuccessCallback,
    /// Fired when the open fails.
    pub on_error: ErrorCallback,
}

impl OpenCallbacks {
    /// Creates callbacks with only success and error handlers.
    pub fn new(
        on_success: impl FnOnce(Arc<dyn EngineConnection>) + Send + 'static,
        on_error: impl FnOnce(EngineError) + Send + 'static,
    ) -> Self {
        Self {
            on_upgrade_needed: None,
            on_blocked: None,
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }

    /// Adds an upgrade handler.
    #[must_use]
    pub fn on_upgrade_needed(
        mut self,
        handler: impl FnOnce(&dyn UpgradeContext) -> EngineResult<()> + Send + 'static,
    ) -> Self {
        self.on_upgrade_needed = Some(Box::new(handler));
        self
    }

    /// Adds a blocked handler.
    #[must_use]
    pub fn on_blocked(mut self, handler: impl FnOnce(VersionChange) + Send + 'static) -> Self {
        self.on_blocked = Some(Box::new(handler));
        self
    }
}

/// Callbacks of a delete request.
pub struct DeleteCallbacks {
    /// Fired when other connections stay open.
    pub on_blocked: Option<BlockedCallback>,
    /// Fired once the database is gone.
    pub on_success: Task,
    /// Fired when the deletion fails.
    pub on_error: ErrorCallback,
}

impl DeleteCallbacks {
    /// Creates callbacks with success and error handlers.
    pub fn new(
        on_success: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(EngineError) + Send + 'static,
    ) -> Self {
        Self {
            on_blocked: None,
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }

    /// Adds a blocked handler.
    #[must_use]
    pub fn on_blocked(mut self, handler: impl FnOnce(VersionChange) + Send + 'static) -> Self {
        self.on_blocked = Some(Box::new(handler));
        self
    }
}

/// Callbacks of a transaction.
pub struct TransactionCallbacks {
    /// Fired after the transaction commits.
    pub on_complete: Task,
    /// Fired for each failed request, before the abort.
    pub on_error: Option<Box<dyn FnMut(EngineError) + Send>>,
    /// Fired after the transaction rolls back, with the cause.
    pub on_abort: ErrorCallback,
}

impl TransactionCallbacks {
    /// Creates callbacks with completion and abort handlers.
    pub fn new(
        on_complete: impl FnOnce() + Send + 'static,
        on_abort: impl FnOnce(EngineError) + Send + 'static,
    ) -> Self {
        Self {
            on_complete: Box::new(on_complete),
            on_error: None,
            on_abort: Box::new(on_abort),
        }
    }

    /// Adds a per-request error handler.
    #[must_use]
    pub fn on_error(mut self, handler: impl FnMut(EngineError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }
}

/// Opens and deletes databases.
///
/// # Invariants
///
/// - Every callback of an operation fires on the engine's event loop
/// - Exactly one of success or error fires per open or delete
/// - An upgrade callback runs before success and inside the upgrade
///   transaction
///
/// # Implementors
///
/// - [`super::MemoryEngine`] - In-process engine for tests and tools
/// - [`super::UnavailableEngine`] - Stand-in for hosts without storage
pub trait EngineFactory: Send + Sync {
    /// Opens a database, creating it if it does not exist.
    ///
    /// With `version` omitted the database opens at its current version,
    /// or at version 1 when it is new.
    fn open(&self, name: &str, version: Option<u32>, callbacks: OpenCallbacks);

    /// Deletes a database. Deleting a missing database succeeds.
    fn delete_database(&self, name: &str, callbacks: DeleteCallbacks);

    /// Lists stored databases.
    fn databases(&self, callback: DatabasesCallback);
}

/// An open connection to one database.
pub trait EngineConnection: Send + Sync {
    /// The database name.
    fn name(&self) -> &str;

    /// The database version this connection was opened at.
    fn version(&self) -> u32;

    /// Names of the object stores, sorted.
    fn object_store_names(&self) -> Vec<String>;

    /// Starts a transaction over the named stores.
    ///
    /// Only callable from inside the engine's event loop; use
    /// [`EngineConnection::dispatch`] to get there.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The call is made outside the event loop or the connection is closed
    /// - A store does not exist or the scope is empty
    /// - The mode is [`TransactionMode::VersionChange`]
    fn transaction(
        &self,
        stores: &[String],
        mode: TransactionMode,
        callbacks: TransactionCallbacks,
    ) -> EngineResult<Arc<dyn EngineTransaction>>;

    /// Queues a task on the engine's event loop.
    fn dispatch(&self, task: Task);

    /// Closes the connection once its transactions finish.
    fn close(&self);

    /// Installs the handler notified about upgrades and deletions
    /// requested elsewhere.
    fn set_on_version_change(&self, handler: VersionChangeHandler);
}

/// A live transaction.
///
/// Requests can be issued while the transaction is active: during the task
/// that created it and during its own request callbacks. It commits on its
/// own once it is inactive and has no pending requests.
pub trait EngineTransaction: Send + Sync {
    /// The transaction mode.
    fn mode(&self) -> TransactionMode;

    /// The stores the transaction may touch.
    fn scope(&self) -> Vec<String>;

    /// Issues a request.
    ///
    /// A failed request aborts the transaction after its callback runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active, the target is out
    /// of scope, or a write is issued in a read-only transaction.
    fn request(
        &self,
        target: RequestTarget,
        request: StoreRequest,
        callback: RequestCallback,
    ) -> EngineResult<()>;

    /// Opens a cursor. The callback fires once per step; call
    /// [`EngineCursor::continue_`] inside it to receive the next step.
    ///
    /// # Errors
    ///
    /// Same as [`EngineTransaction::request`].
    fn open_cursor(
        &self,
        target: RequestTarget,
        range: Option<KeyRange>,
        direction: CursorDirection,
        key_only: bool,
        callback: CursorCallback,
    ) -> EngineResult<()>;

    /// Commits as soon as pending requests finish; no new requests are
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction already finished.
    fn commit(&self) -> EngineResult<()>;

    /// Aborts and rolls back.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction already finished.
    fn abort(&self) -> EngineResult<()>;
}

/// The position of an open cursor, valid during its callback.
pub trait EngineCursor {
    /// The key at the cursor position (the index key for index cursors).
    fn key(&self) -> &Key;

    /// The primary key of the record at the cursor position.
    fn primary_key(&self) -> &Key;

    /// The record, or `None` for key-only cursors.
    fn value(&self) -> Option<&Value>;

    /// Requests the next step.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor was already advanced in this step or
    /// the transaction is not active.
    fn continue_(&self) -> EngineResult<()>;

    /// Skips `count - 1` records and requests the step after.
    ///
    /// # Errors
    ///
    /// Same as [`EngineCursor::continue_`], and for a zero count.
    fn advance(&self, count: u32) -> EngineResult<()>;

    /// Replaces the record at the cursor position.
    ///
    /// # Errors
    ///
    /// Returns an error in read-only transactions, for key-only cursors,
    /// or when the new record carries a different inline key.
    fn update(&self, value: Value, callback: RequestCallback) -> EngineResult<()>;

    /// Deletes the record at the cursor position.
    ///
    /// # Errors
    ///
    /// Returns an error in read-only transactions.
    fn delete(&self, callback: RequestCallback) -> EngineResult<()>;
}

/// Schema editing during an upgrade.
pub trait UpgradeContext {
    /// The version before the upgrade; 0 for a new database.
    fn old_version(&self) -> u32;

    /// The version being upgraded to.
    fn new_version(&self) -> u32;

    /// The connection being opened.
    fn connection(&self) -> Arc<dyn EngineConnection>;

    /// The upgrade transaction, usable for data migration.
    fn transaction(&self) -> Arc<dyn EngineTransaction>;

    /// Names of the object stores, sorted.
    fn object_store_names(&self) -> Vec<String>;

    /// Names of a store's indexes, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown stores.
    fn index_names(&self, store: &str) -> EngineResult<Vec<String>>;

    /// Creates an object store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Constraint`] if the store exists and
    /// [`EngineError::InvalidAccess`] for auto-increment stores with a
    /// compound or empty key path.
    fn create_object_store(&self, name: &str, params: &StoreParameters) -> EngineResult<()>;

    /// Deletes an object store and its records.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown stores.
    fn delete_object_store(&self, name: &str) -> EngineResult<()>;

    /// Creates an index over existing and future records.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Constraint`] if the index exists or existing
    /// records violate a unique index.
    fn create_index(
        &self,
        store: &str,
        name: &str,
        key_path: &KeyPath,
        params: &IndexParameters,
    ) -> EngineResult<()>;

    /// Deletes an index.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown stores or indexes.
    fn delete_index(&self, store: &str, name: &str) -> EngineResult<()>;
}
