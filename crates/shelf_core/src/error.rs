//! Error types for Shelf core.

use shelf_engine::EngineError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Shelf core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Opening a connection failed.
    #[error("cannot open database {database}: {source}")]
    Connection {
        /// The database being opened.
        database: String,
        /// The engine's error.
        #[source]
        source: EngineError,
    },

    /// No storage engine exists in this environment.
    #[error("storage not available: {0}")]
    NotAvailable(String),

    /// An operation named a store the database does not have.
    #[error("object store {store} not found in database {database}")]
    StoreNotFound {
        /// The database searched.
        database: String,
        /// The missing store.
        store: String,
    },

    /// A transaction failed or was aborted.
    #[error("transaction failed: {0}")]
    Transaction(#[source] EngineError),

    /// Deleting a database was blocked by open connections.
    #[error("deleting database {database} is blocked by open connections")]
    DeleteBlocked {
        /// The database being deleted.
        database: String,
    },

    /// A database configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// The named database was never registered.
    #[error("database {name} is not initialized")]
    DatabaseNotInitialized {
        /// The requested name.
        name: String,
    },

    /// No database was named and none is the default.
    #[error("no default database is configured")]
    NoDefaultDatabase,

    /// Converting a record to or from JSON failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A migration step failed.
    #[error("migration to version {version} failed: {message}")]
    Migration {
        /// The version of the failing step.
        version: u32,
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a connection error.
    pub fn connection(database: impl Into<String>, source: EngineError) -> Self {
        Self::Connection {
            database: database.into(),
            source,
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a store not found error.
    pub fn store_not_found(database: impl Into<String>, store: impl Into<String>) -> Self {
        Self::StoreNotFound {
            database: database.into(),
            store: store.into(),
        }
    }

    /// Creates a migration error.
    pub fn migration(version: u32, message: impl Into<String>) -> Self {
        Self::Migration {
            version,
            message: message.into(),
        }
    }

    /// Maps an engine error raised while opening `database`.
    pub(crate) fn from_open(database: &str, err: EngineError) -> Self {
        match err {
            EngineError::NotAvailable(reason) => Self::NotAvailable(reason),
            other => Self::connection(database, other),
        }
    }

    /// Maps an engine error raised while deleting `database`.
    pub(crate) fn from_delete(database: &str, err: EngineError) -> Self {
        match err {
            EngineError::Blocked { .. } => Self::DeleteBlocked {
                database: database.to_string(),
            },
            other => Self::from_open(database, other),
        }
    }

    /// Converts the error back into an engine error, used where the engine
    /// expects one (upgrade callbacks).
    pub(crate) fn into_engine(self) -> EngineError {
        match self {
            Self::Transaction(source) | Self::Connection { source, .. } => source,
            Self::NotAvailable(reason) => EngineError::NotAvailable(reason),
            other => EngineError::aborted(other.to_string()),
        }
    }

    /// The engine error behind this error, if any.
    #[must_use]
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::Transaction(source) | Self::Connection { source, .. } => Some(source),
            _ => None,
        }
    }
}
