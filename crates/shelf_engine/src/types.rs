//! Plain data types shared by engines and their callers.

use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    /// Reads only; may run alongside other readers.
    ReadOnly,
    /// Reads and writes; exclusive over its scope.
    ReadWrite,
    /// Schema upgrade; exclusive over the whole database.
    VersionChange,
}

impl TransactionMode {
    /// Returns true if the mode permits writes.
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

/// Cursor iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    /// Ascending keys.
    #[default]
    Next,
    /// Ascending keys, first record per distinct key.
    NextUnique,
    /// Descending keys.
    Prev,
    /// Descending keys, first record per distinct key.
    PrevUnique,
}

impl CursorDirection {
    /// Returns true for descending directions.
    #[must_use]
    pub const fn is_reverse(self) -> bool {
        matches!(self, CursorDirection::Prev | CursorDirection::PrevUnique)
    }

    /// Returns true for directions that skip duplicate keys.
    #[must_use]
    pub const fn is_unique(self) -> bool {
        matches!(self, CursorDirection::NextUnique | CursorDirection::PrevUnique)
    }
}

/// Key configuration of a new object store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreParameters {
    /// Where the key lives inside each record; `None` for out-of-line keys.
    pub key_path: Option<KeyPath>,
    /// Whether the store generates keys.
    pub auto_increment: bool,
}

/// Options of a new index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexParameters {
    /// Reject two records with the same index key.
    pub unique: bool,
    /// Index each element of an array key separately.
    pub multi_entry: bool,
}

/// Name and version of a stored database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name.
    pub name: String,
    /// Current version.
    pub version: u32,
}

/// Versions involved in an upgrade or deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChange {
    /// The version before the change.
    pub old_version: u32,
    /// The version after the change; `None` when the database is deleted.
    pub new_version: Option<u32>,
}

/// What a request operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// An object store.
    Store(String),
    /// An index of an object store.
    Index {
        /// The owning object store.
        store: String,
        /// The index name.
        index: String,
    },
}

impl RequestTarget {
    /// Targets an object store.
    pub fn store(name: impl Into<String>) -> Self {
        RequestTarget::Store(name.into())
    }

    /// Targets an index.
    pub fn index(store: impl Into<String>, index: impl Into<String>) -> Self {
        RequestTarget::Index {
            store: store.into(),
            index: index.into(),
        }
    }

    /// The object store the target belongs to.
    #[must_use]
    pub fn store_name(&self) -> &str {
        match self {
            RequestTarget::Store(store) | RequestTarget::Index { store, .. } => store,
        }
    }
}

/// A single request against a store or index.
#[derive(Debug, Clone)]
pub enum StoreRequest {
    /// Insert a record; fails if the key exists.
    Add {
        /// The record.
        value: Value,
        /// Explicit key for stores without a key path.
        key: Option<Key>,
    },
    /// Insert or replace a record.
    Put {
        /// The record.
        value: Value,
        /// Explicit key for stores without a key path.
        key: Option<Key>,
    },
    /// First record in the range.
    Get(KeyRange),
    /// All records in the range, up to a limit.
    GetAll {
        /// Range to read; everything when `None`.
        range: Option<KeyRange>,
        /// Maximum number of records.
        limit: Option<usize>,
    },
    /// All primary keys in the range, up to a limit.
    GetAllKeys {
        /// Range to read; everything when `None`.
        range: Option<KeyRange>,
        /// Maximum number of keys.
        limit: Option<usize>,
    },
    /// Number of records in the range.
    Count(Option<KeyRange>),
    /// Delete every record in the range.
    Delete(KeyRange),
    /// Delete every record.
    Clear,
}

impl StoreRequest {
    /// Returns true for requests that modify data.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreRequest::Add { .. }
                | StoreRequest::Put { .. }
                | StoreRequest::Delete(_)
                | StoreRequest::Clear
        )
    }
}

/// The result of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutput {
    /// The key of a written record.
    Key(Key),
    /// A single record lookup.
    Value(Option<Value>),
    /// Several records.
    Values(Vec<Value>),
    /// Several primary keys.
    Keys(Vec<Key>),
    /// A record count.
    Count(usize),
    /// The request completed without a result.
    Done,
}

impl RequestOutput {
    fn mismatch(&self, expected: &str) -> EngineError {
        EngineError::invalid_state(format!("expected {expected} output, got {self:?}"))
    }

    /// Unwraps a written key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for any other output.
    pub fn into_key(self) -> EngineResult<Key> {
        match self {
            RequestOutput::Key(key) => Ok(key),
            other => Err(other.mismatch("key")),
        }
    }

    /// Unwraps a single record lookup.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for any other output.
    pub fn into_value(self) -> EngineResult<Option<Value>> {
        match self {
            RequestOutput::Value(value) => Ok(value),
            other => Err(other.mismatch("value")),
        }
    }

    /// Unwraps several records.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for any other output.
    pub fn into_values(self) -> EngineResult<Vec<Value>> {
        match self {
            RequestOutput::Values(values) => Ok(values),
            other => Err(other.mismatch("values")),
        }
    }

    /// Unwraps several primary keys.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for any other output.
    pub fn into_keys(self) -> EngineResult<Vec<Key>> {
        match self {
            RequestOutput::Keys(keys) => Ok(keys),
            other => Err(other.mismatch("keys")),
        }
    }

    /// Unwraps a record count.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for any other output.
    pub fn into_count(self) -> EngineResult<usize> {
        match self {
            RequestOutput::Count(count) => Ok(count),
            other => Err(other.mismatch("count")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_output_accessors() {
        assert_eq!(RequestOutput::Key(Key::from(4)).into_key().unwrap(), Key::from(4));
        assert_eq!(
            RequestOutput::Value(Some(json!(1))).into_value().unwrap(),
            Some(json!(1))
        );
        assert_eq!(RequestOutput::Count(2).into_count().unwrap(), 2);
        assert!(matches!(
            RequestOutput::Done.into_values(),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn writes_are_classified() {
        assert!(StoreRequest::Clear.is_write());
        assert!(!StoreRequest::Count(None).is_write());
        assert!(TransactionMode::VersionChange.is_write());
        assert!(!TransactionMode::ReadOnly.is_write());
    }

    #[test]
    fn directions() {
        assert!(CursorDirection::PrevUnique.is_reverse());
        assert!(CursorDirection::PrevUnique.is_unique());
        assert!(!CursorDirection::Next.is_unique());
        assert_eq!(CursorDirection::default(), CursorDirection::Next);
    }
}
