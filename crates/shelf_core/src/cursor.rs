//! Cursor queries and streams.

use crate::error::{CoreError, CoreResult};
use futures::stream::BoxStream;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shelf_engine::{CursorDirection, EngineCursor, Key, KeyRange, RequestTarget};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// What a cursor walks over.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorQuery {
    /// The object store.
    pub store: String,
    /// Walk this index of the store instead of the store itself.
    pub index: Option<String>,
    /// Only visit keys in this range.
    pub range: Option<KeyRange>,
    /// Iteration order.
    pub direction: CursorDirection,
}

impl CursorQuery {
    /// Walks every record of `store` in key order.
    pub fn store(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            index: None,
            range: None,
            direction: CursorDirection::Next,
        }
    }

    /// Walks an index of the store.
    #[must_use]
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Restricts the walk to `range`.
    #[must_use]
    pub fn range(mut self, range: impl Into<KeyRange>) -> Self {
        self.range = Some(range.into());
        self
    }

    /// Sets the iteration order.
    #[must_use]
    pub const fn direction(mut self, direction: CursorDirection) -> Self {
        self.direction = direction;
        self
    }

    pub(crate) fn target(&self) -> RequestTarget {
        match &self.index {
            Some(index) => RequestTarget::index(&self.store, index),
            None => RequestTarget::store(&self.store),
        }
    }
}

/// One cursor position.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry<T> {
    /// The cursor key: the index key for index cursors, the primary key
    /// otherwise.
    pub key: Key,
    /// The record's primary key.
    pub primary_key: Key,
    /// The record.
    pub value: T,
}

impl CursorEntry<Value> {
    pub(crate) fn from_cursor(cursor: &dyn EngineCursor) -> Self {
        Self {
            key: cursor.key().clone(),
            primary_key: cursor.primary_key().clone(),
            value: cursor.value().cloned().unwrap_or(Value::Null),
        }
    }

    /// Converts the record into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the record does not fit `T`.
    pub fn decode<T: DeserializeOwned>(self) -> CoreResult<CursorEntry<T>> {
        Ok(CursorEntry {
            key: self.key,
            primary_key: self.primary_key,
            value: serde_json::from_value(self.value)?,
        })
    }
}

/// What a cursor visitor wants done with the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorAction<T> {
    /// Move on.
    Continue,
    /// Replace the record, then move on.
    Update(T),
    /// Delete the record, then move on.
    Delete,
    /// End the walk.
    Stop,
}

/// An index key with the primary key of its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexKey {
    /// The index key.
    pub key: Key,
    /// The primary key of the indexed record.
    pub primary_key: Key,
}

/// Lazy stream of cursor entries.
///
/// Nothing happens until the first poll: then a connection opens, a
/// read-only transaction starts and the cursor walks the query. Dropping
/// the stream stops the walk; the transaction then commits on its own. The
/// stream is finite and cannot be restarted.
#[must_use = "streams do nothing unless polled"]
pub struct CursorStream<T> {
    inner: BoxStream<'static, CoreResult<CursorEntry<T>>>,
}

impl<T> CursorStream<T> {
    pub(crate) fn new(inner: BoxStream<'static, CoreResult<CursorEntry<T>>>) -> Self {
        Self { inner }
    }
}

impl<T> Stream for CursorStream<T> {
    type Item = CoreResult<CursorEntry<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> fmt::Debug for CursorStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorStream").finish_non_exhaustive()
    }
}

pub(crate) fn to_value<T: Serialize>(record: &T) -> CoreResult<Value> {
    serde_json::to_value(record).map_err(CoreError::from)
}
