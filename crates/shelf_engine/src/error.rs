//! Error types for engine operations.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by a storage engine.
///
/// The variants follow the exception names of the IndexedDB object model so
/// that an engine backed by a real IndexedDB host can report its failures
/// without losing information.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No storage engine exists in this environment.
    #[error("storage engine not available: {0}")]
    NotAvailable(String),

    /// A named database object (store, index, record) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A key or value is not acceptable.
    #[error("data error: {0}")]
    Data(String),

    /// A write was attempted in a read-only transaction.
    #[error("transaction is read-only, cannot write to {0}")]
    ReadOnly(String),

    /// A request was issued against a transaction that is not active.
    #[error("transaction is not active")]
    TransactionInactive,

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation parameters are not valid for the target.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// The transaction was aborted.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// The requested version is lower than the stored version.
    #[error("requested version {requested} is lower than the current version {current}")]
    VersionTooLow {
        /// The version the caller asked for.
        requested: u32,
        /// The version the database currently has.
        current: u32,
    },

    /// Other connections stayed open after a version change notice.
    #[error("{database} is blocked by {open_connections} open connection(s)")]
    Blocked {
        /// The database being upgraded or deleted.
        database: String,
        /// Connections that did not close.
        open_connections: usize,
    },

    /// The engine shut down before the operation completed.
    #[error("engine has shut down")]
    Closed,
}

impl EngineError {
    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a constraint error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint(message.into())
    }

    /// Creates a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Creates an aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// Returns true for the error a blocked open or delete reports.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_object() {
        let err = EngineError::not_found("object store people");
        assert_eq!(err.to_string(), "not found: object store people");

        let err = EngineError::VersionTooLow {
            requested: 1,
            current: 3,
        };
        assert!(err.to_string().contains("lower than the current version 3"));
    }

    #[test]
    fn blocked_is_detected() {
        let err = EngineError::Blocked {
            database: "MyDb".into(),
            open_connections: 1,
        };
        assert!(err.is_blocked());
        assert!(!EngineError::Closed.is_blocked());
    }
}
