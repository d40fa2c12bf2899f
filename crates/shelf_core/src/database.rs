//! Database façade.

use crate::config::StoreSchema;
use crate::connection::{Connection, ConnectionOpener};
use crate::cursor::{to_value, CursorAction, CursorEntry, CursorQuery, CursorStream, IndexKey};
use crate::error::{CoreError, CoreResult};
use crate::migration::{MigrationFactory, UpgradePlan};
use crate::registry::Registry;
use crate::transaction::{stream_transaction, with_transaction};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shelf_engine::{
    CursorDirection, EngineError, Key, KeyRange, RequestOutput, RequestTarget, StoreRequest,
    TransactionMode,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn next_version(current: u32) -> CoreResult<u32> {
    current
        .checked_add(1)
        .ok_or_else(|| CoreError::config("database version cannot be raised further"))
}

/// Types that can be stored as records.
///
/// Implemented for every serde type that can cross threads.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Record for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A record together with its primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<T> {
    /// The primary key.
    pub key: Key,
    /// The record as stored, key path field included.
    pub value: T,
}

/// Opens `name` at its registered version. If the database on disk is
/// newer, the registry adopts the disk version.
pub(crate) async fn open_adopting(
    opener: &ConnectionOpener,
    registry: &RwLock<Registry>,
    name: &str,
) -> CoreResult<Connection> {
    let (version, plan) = registry.read().open_args(name)?;
    match opener.open(name, Some(version), Some(&plan)).await {
        Err(CoreError::Connection {
            source: EngineError::VersionTooLow { requested, current },
            ..
        }) => {
            warn!(
                database = name,
                configured = requested,
                on_disk = current,
                "database on disk is newer than its configuration, using the disk version"
            );
            registry.write().set_version(name, current)?;
            opener.open(name, Some(current), None).await
        }
        other => other,
    }
}

fn transaction_error(err: EngineError) -> CoreError {
    CoreError::Transaction(err)
}

fn decode<T: DeserializeOwned>(value: Value) -> CoreResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn decode_all<T: DeserializeOwned>(values: Vec<Value>) -> CoreResult<Vec<T>> {
    values.into_iter().map(decode).collect()
}

fn decode_optional<T: DeserializeOwned>(value: Option<Value>) -> CoreResult<Option<T>> {
    value.map(decode).transpose()
}

/// One database of a [`crate::Shelf`].
///
/// Every operation opens its own connection, runs one transaction (or one
/// per item for [`Database::bulk_add_each`]) and closes the connection
/// before returning.
///
/// # Example
///
/// ```rust
/// use shelf_core::{DatabaseConfig, MemoryEngine, Shelf, StoreSchema};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Person {
///     #[serde(skip_serializing_if = "Option::is_none")]
///     id: Option<u32>,
///     name: String,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let shelf = Shelf::builder()
///     .engine(MemoryEngine::new()?)
///     .database(
///         DatabaseConfig::new("MyDb", 1)
///             .store(StoreSchema::new("people").key_path("id").auto_increment(true)),
///     )
///     .build()
///     .await?;
///
/// let db = shelf.database(None)?;
/// let ada = db.add("people", &Person { id: None, name: "Ada".into() }).await?;
/// assert_eq!(ada.value.id, Some(1));
/// assert_eq!(db.count("people", None).await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
    name: Arc<str>,
    opener: ConnectionOpener,
    registry: Arc<RwLock<Registry>>,
}

impl Database {
    pub(crate) fn new(name: &str, opener: ConnectionOpener, registry: Arc<RwLock<Registry>>) -> Self {
        Self {
            name: Arc::from(name),
            opener,
            registry,
        }
    }

    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a connection at the registered version.
    ///
    /// Operations do this on their own; use it to keep a connection for
    /// [`with_transaction`] bodies.
    ///
    /// # Errors
    ///
    /// See [`ConnectionOpener::open`].
    pub async fn connect(&self) -> CoreResult<Connection> {
        open_adopting(&self.opener, &self.registry, &self.name).await
    }

    /// The version of the database on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn version(&self) -> CoreResult<u32> {
        Ok(self.connect().await?.version())
    }

    /// Names of the object stores, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened.
    pub async fn object_store_names(&self) -> CoreResult<Vec<String>> {
        Ok(self.connect().await?.object_store_names())
    }

    async fn single<R: Send + 'static>(
        &self,
        store: &str,
        mode: TransactionMode,
        target: RequestTarget,
        request: StoreRequest,
        map: impl FnOnce(RequestOutput) -> CoreResult<R> + Send + 'static,
    ) -> CoreResult<R> {
        let conn = self.connect().await?;
        with_transaction(&conn, &[store], mode, move |scope, outcome| {
            let outcome = outcome.clone();
            scope.request(target, request, move |output| {
                outcome.set(map(output)?);
                Ok(())
            })
        })
        .await
    }

    async fn write_and_read(
        &self,
        store: &str,
        value: Value,
        key: Option<Key>,
        overwrite: bool,
    ) -> CoreResult<(Key, Value)> {
        let conn = self.connect().await?;
        let target = RequestTarget::store(store);
        with_transaction(&conn, &[store], TransactionMode::ReadWrite, move |scope, outcome| {
            let reader = scope.clone();
            let outcome = outcome.clone();
            let read_target = target.clone();
            let request = if overwrite {
                StoreRequest::Put { value, key }
            } else {
                StoreRequest::Add { value, key }
            };
            scope.request(target, request, move |output| {
                let key = output.into_key().map_err(transaction_error)?;
                reader.request(
                    read_target,
                    StoreRequest::Get(KeyRange::only(key.clone())),
                    move |output| {
                        let value = output.into_value().map_err(transaction_error)?;
                        outcome.set((key, value.unwrap_or(Value::Null)));
                        Ok(())
                    },
                )
            })
        })
        .await
    }

    /// Adds a record and returns it as stored, with its key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if a record with the same key
    /// exists or a unique index is violated.
    pub async fn add<T: Record>(&self, store: &str, record: &T) -> CoreResult<Keyed<T>> {
        let (key, value) = self
            .write_and_read(store, to_value(record)?, None, false)
            .await?;
        Ok(Keyed {
            key,
            value: decode(value)?,
        })
    }

    /// Adds a record under an explicit key, for stores without a key path.
    ///
    /// # Errors
    ///
    /// Same as [`Database::add`].
    pub async fn add_with_key<T: Record>(
        &self,
        store: &str,
        record: &T,
        key: impl Into<Key>,
    ) -> CoreResult<Keyed<T>> {
        let (key, value) = self
            .write_and_read(store, to_value(record)?, Some(key.into()), false)
            .await?;
        Ok(Keyed {
            key,
            value: decode(value)?,
        })
    }

    async fn bulk_write(
        &self,
        store: &str,
        values: Vec<Value>,
        overwrite: bool,
    ) -> CoreResult<Vec<Key>> {
        let conn = self.connect().await?;
        let store_name = store.to_string();
        with_transaction(&conn, &[store], TransactionMode::ReadWrite, move |scope, outcome| {
            let total = values.len();
            let keys = Arc::new(Mutex::new(Vec::with_capacity(total)));
            for value in values {
                let keys = Arc::clone(&keys);
                let outcome = outcome.clone();
                let request = if overwrite {
                    StoreRequest::Put { value, key: None }
                } else {
                    StoreRequest::Add { value, key: None }
                };
                scope.request(RequestTarget::store(&store_name), request, move |output| {
                    let mut keys = keys.lock();
                    keys.push(output.into_key().map_err(transaction_error)?);
                    if keys.len() == total {
                        outcome.set(std::mem::take(&mut *keys));
                    }
                    Ok(())
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Adds records in one transaction. Either all are added or none.
    ///
    /// Returns the keys in input order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if any record fails; nothing is
    /// written then.
    pub async fn bulk_add<T: Record>(&self, store: &str, records: &[T]) -> CoreResult<Vec<Key>> {
        let values = records.iter().map(to_value).collect::<CoreResult<Vec<_>>>()?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        self.bulk_write(store, values, false).await
    }

    /// Adds records one transaction each.
    ///
    /// A failing record does not undo the ones before it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the connection cannot be opened; record
    /// failures are reported per item.
    pub async fn bulk_add_each<T: Record>(
        &self,
        store: &str,
        records: &[T],
    ) -> CoreResult<Vec<CoreResult<Key>>> {
        let conn = self.connect().await?;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = match to_value(record) {
                Ok(value) => {
                    let target = RequestTarget::store(store);
                    with_transaction(&conn, &[store], TransactionMode::ReadWrite, move |scope, outcome| {
                        let outcome = outcome.clone();
                        scope.request(target, StoreRequest::Add { value, key: None }, move |output| {
                            outcome.set(output.into_key().map_err(transaction_error)?);
                            Ok(())
                        })
                    })
                    .await
                }
                Err(err) => Err(err),
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Deletes records in one transaction and returns the records left
    /// in the store, in key order, read in the same transaction.
    ///
    /// Keys without a record are skipped. Either every delete is applied
    /// or, if the transaction aborts, none is.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] for unknown stores,
    /// [`CoreError::Serialization`] if a remaining record does not fit `T`
    /// and [`CoreError::Transaction`] if the transaction aborts. Nothing is
    /// deleted in any of these cases.
    pub async fn bulk_delete<T: Record>(&self, store: &str, keys: &[Key]) -> CoreResult<Vec<T>> {
        let conn = self.connect().await?;
        let store_name = store.to_string();
        let ranges: Vec<KeyRange> = keys.iter().map(|key| KeyRange::only(key.clone())).collect();
        let deleted = ranges.len();
        let left = with_transaction(&conn, &[store], TransactionMode::ReadWrite, move |scope, outcome| {
            for range in ranges {
                scope.request(RequestTarget::store(&store_name), StoreRequest::Delete(range), |_| Ok(()))?;
            }
            let outcome = outcome.clone();
            scope.request(
                RequestTarget::store(&store_name),
                StoreRequest::GetAll {
                    range: None,
                    limit: None,
                },
                move |output| {
                    let values = output.into_values().map_err(transaction_error)?;
                    outcome.set(decode_all::<T>(values)?);
                    Ok(())
                },
            )
        })
        .await?;
        debug!(database = %self.name, store, deleted, "bulk delete committed");
        Ok(left)
    }

    /// Reads the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] for unknown stores and
    /// [`CoreError::Serialization`] if the record does not fit `T`.
    pub async fn get_by_key<T: Record>(
        &self,
        store: &str,
        key: impl Into<Key>,
    ) -> CoreResult<Option<T>> {
        let value = self
            .single(
                store,
                TransactionMode::ReadOnly,
                RequestTarget::store(store),
                StoreRequest::Get(KeyRange::only(key)),
                |output| output.into_value().map_err(transaction_error),
            )
            .await?;
        decode_optional(value)
    }

    /// Reads a record by numeric or string id.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_key`].
    pub async fn get_by_id<T: Record>(
        &self,
        store: &str,
        id: impl Into<Key>,
    ) -> CoreResult<Option<T>> {
        self.get_by_key(store, id).await
    }

    /// Reads several records in one transaction, in the order of `keys`.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_key`].
    pub async fn bulk_get<T: Record>(&self, store: &str, keys: &[Key]) -> CoreResult<Vec<Option<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;
        let keys = keys.to_vec();
        let store_name = store.to_string();
        let values = with_transaction(&conn, &[store], TransactionMode::ReadOnly, move |scope, outcome| {
            let total = keys.len();
            let found = Arc::new(Mutex::new((vec![None; total], 0usize)));
            for (slot, key) in keys.into_iter().enumerate() {
                let found = Arc::clone(&found);
                let outcome = outcome.clone();
                scope.request(
                    RequestTarget::store(&store_name),
                    StoreRequest::Get(KeyRange::only(key)),
                    move |output| {
                        let mut found = found.lock();
                        found.0[slot] = output.into_value().map_err(transaction_error)?;
                        found.1 += 1;
                        if found.1 == total {
                            outcome.set(std::mem::take(&mut found.0));
                        }
                        Ok(())
                    },
                )?;
            }
            Ok(())
        })
        .await?;
        values.into_iter().map(decode_optional).collect()
    }

    /// Reads the first record whose `index` key equals `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] for unknown indexes, otherwise
    /// the same as [`Database::get_by_key`].
    pub async fn get_by_index<T: Record>(
        &self,
        store: &str,
        index: &str,
        key: impl Into<Key>,
    ) -> CoreResult<Option<T>> {
        let value = self
            .single(
                store,
                TransactionMode::ReadOnly,
                RequestTarget::index(store, index),
                StoreRequest::Get(KeyRange::only(key)),
                |output| output.into_value().map_err(transaction_error),
            )
            .await?;
        decode_optional(value)
    }

    /// Reads every record of a store in key order.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_key`].
    pub async fn get_all<T: Record>(&self, store: &str) -> CoreResult<Vec<T>> {
        let values = self
            .single(
                store,
                TransactionMode::ReadOnly,
                RequestTarget::store(store),
                StoreRequest::GetAll {
                    range: None,
                    limit: None,
                },
                |output| output.into_values().map_err(transaction_error),
            )
            .await?;
        decode_all(values)
    }

    /// Reads the records of an index range in index order by walking a
    /// cursor to its end.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_index`].
    pub async fn get_all_by_index<T: Record>(
        &self,
        store: &str,
        index: &str,
        range: Option<KeyRange>,
    ) -> CoreResult<Vec<T>> {
        let conn = self.connect().await?;
        let target = RequestTarget::index(store, index);
        let values = with_transaction(&conn, &[store], TransactionMode::ReadOnly, move |scope, outcome| {
            let outcome = outcome.clone();
            let mut values = Vec::new();
            scope.open_cursor(target, range, CursorDirection::Next, false, move |cursor| {
                match cursor {
                    Some(cursor) => {
                        values.push(cursor.value().cloned().unwrap_or(Value::Null));
                        cursor.continue_().map_err(transaction_error)
                    }
                    None => {
                        outcome.set(std::mem::take(&mut values));
                        Ok(())
                    }
                }
            })
        })
        .await?;
        decode_all(values)
    }

    /// Lists the keys of an index range with the primary keys of their
    /// records.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_index`].
    pub async fn get_all_keys_by_index(
        &self,
        store: &str,
        index: &str,
        range: Option<KeyRange>,
    ) -> CoreResult<Vec<IndexKey>> {
        let conn = self.connect().await?;
        let target = RequestTarget::index(store, index);
        with_transaction(&conn, &[store], TransactionMode::ReadOnly, move |scope, outcome| {
            let outcome = outcome.clone();
            let mut keys = Vec::new();
            scope.open_cursor(target, range, CursorDirection::Next, true, move |cursor| {
                match cursor {
                    Some(cursor) => {
                        keys.push(IndexKey {
                            key: cursor.key().clone(),
                            primary_key: cursor.primary_key().clone(),
                        });
                        cursor.continue_().map_err(transaction_error)
                    }
                    None => {
                        outcome.set(std::mem::take(&mut keys));
                        Ok(())
                    }
                }
            })
        })
        .await
    }

    /// Writes a record, replacing any record with the same key, and
    /// returns it as stored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if a unique index is violated;
    /// the write is rolled back.
    pub async fn update<T: Record>(&self, store: &str, record: &T) -> CoreResult<T> {
        let (_, value) = self
            .write_and_read(store, to_value(record)?, None, true)
            .await?;
        decode(value)
    }

    /// Writes a record under an explicit key, for stores without a key
    /// path.
    ///
    /// # Errors
    ///
    /// Same as [`Database::update`].
    pub async fn update_with_key<T: Record>(
        &self,
        store: &str,
        record: &T,
        key: impl Into<Key>,
    ) -> CoreResult<T> {
        let (_, value) = self
            .write_and_read(store, to_value(record)?, Some(key.into()), true)
            .await?;
        decode(value)
    }

    /// Writes records in one transaction and returns the last key.
    ///
    /// An empty slice resolves to `None` without touching the database.
    ///
    /// # Errors
    ///
    /// Same as [`Database::bulk_add`].
    pub async fn bulk_put<T: Record>(&self, store: &str, records: &[T]) -> CoreResult<Option<Key>> {
        let values = records.iter().map(to_value).collect::<CoreResult<Vec<_>>>()?;
        if values.is_empty() {
            return Ok(None);
        }
        Ok(self.bulk_write(store, values, true).await?.pop())
    }

    /// Deletes the record stored under `key`. Missing keys are not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] for unknown stores.
    pub async fn delete(&self, store: &str, key: impl Into<Key>) -> CoreResult<()> {
        self.single(
            store,
            TransactionMode::ReadWrite,
            RequestTarget::store(store),
            StoreRequest::Delete(KeyRange::only(key)),
            |_| Ok(()),
        )
        .await
    }

    /// Deletes every record in an index range.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_index`].
    pub async fn delete_all_by_index(
        &self,
        store: &str,
        index: &str,
        range: Option<KeyRange>,
    ) -> CoreResult<()> {
        let conn = self.connect().await?;
        let target = RequestTarget::index(store, index);
        with_transaction(&conn, &[store], TransactionMode::ReadWrite, move |scope, outcome| {
            let outcome = outcome.clone();
            scope.open_cursor(target, range, CursorDirection::Next, false, move |cursor| {
                match cursor {
                    Some(cursor) => {
                        cursor.delete(Box::new(|_| {})).map_err(transaction_error)?;
                        cursor.continue_().map_err(transaction_error)
                    }
                    None => {
                        outcome.set(());
                        Ok(())
                    }
                }
            })
        })
        .await
    }

    /// Deletes every record of a store.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] for unknown stores.
    pub async fn clear(&self, store: &str) -> CoreResult<()> {
        self.single(
            store,
            TransactionMode::ReadWrite,
            RequestTarget::store(store),
            StoreRequest::Clear,
            |_| Ok(()),
        )
        .await
    }

    /// Counts the records of a store, optionally within a key range.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] for unknown stores.
    pub async fn count(&self, store: &str, range: Option<KeyRange>) -> CoreResult<usize> {
        self.single(
            store,
            TransactionMode::ReadOnly,
            RequestTarget::store(store),
            StoreRequest::Count(range),
            |output| output.into_count().map_err(transaction_error),
        )
        .await
    }

    /// Counts the entries of an index, optionally within a key range.
    ///
    /// # Errors
    ///
    /// Same as [`Database::get_by_index`].
    pub async fn count_by_index(
        &self,
        store: &str,
        index: &str,
        range: Option<KeyRange>,
    ) -> CoreResult<usize> {
        self.single(
            store,
            TransactionMode::ReadOnly,
            RequestTarget::index(store, index),
            StoreRequest::Count(range),
            |output| output.into_count().map_err(transaction_error),
        )
        .await
    }

    /// Streams the entries a cursor visits.
    ///
    /// The stream is lazy: nothing happens until it is first polled.
    ///
    /// The walk runs in a read-only transaction. Use
    /// [`Database::for_each_cursor`] to update or delete records as the
    /// cursor passes them.
    pub fn open_cursor<T: Record>(&self, query: CursorQuery) -> CursorStream<T> {
        let db = self.clone();
        let start = async move {
            let conn = db.connect().await?;
            let store = query.store.clone();
            stream_transaction(
                conn,
                &[store.as_str()],
                TransactionMode::ReadOnly,
                move |scope, emitter| {
                    let emitter = emitter.clone();
                    scope.open_cursor(
                        query.target(),
                        query.range,
                        query.direction,
                        false,
                        move |cursor| {
                            if let Some(cursor) = cursor {
                                if emitter.emit(CursorEntry::from_cursor(cursor)) {
                                    cursor.continue_().map_err(transaction_error)?;
                                }
                            }
                            Ok(())
                        },
                    )
                },
            )
        };
        CursorStream::new(
            stream::once(start)
                .try_flatten()
                .map(|entry| entry.and_then(CursorEntry::decode))
                .boxed(),
        )
    }

    /// Walks a cursor and lets `visitor` continue, update, delete or stop
    /// at each record. Returns the number of records visited.
    ///
    /// The visitor runs inside the live transaction, so updates and
    /// deletes need [`TransactionMode::ReadWrite`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if an update or delete is
    /// rejected (read-only mode, unique index violation); everything the
    /// walk changed is rolled back.
    pub async fn for_each_cursor<T, F>(
        &self,
        query: CursorQuery,
        mode: TransactionMode,
        visitor: F,
    ) -> CoreResult<usize>
    where
        T: Record,
        F: FnMut(CursorEntry<T>) -> CursorAction<T> + Send + 'static,
    {
        let conn = self.connect().await?;
        let store = query.store.clone();
        with_transaction(&conn, &[store.as_str()], mode, move |scope, outcome| {
            let outcome = outcome.clone();
            let mut visitor = visitor;
            let mut visited = 0;
            scope.open_cursor(
                query.target(),
                query.range,
                query.direction,
                false,
                move |cursor| {
                    let Some(cursor) = cursor else {
                        outcome.set(visited);
                        return Ok(());
                    };
                    visited += 1;
                    match visitor(CursorEntry::from_cursor(cursor).decode()?) {
                        CursorAction::Continue => {}
                        CursorAction::Update(record) => cursor
                            .update(to_value(&record)?, Box::new(|_| {}))
                            .map_err(transaction_error)?,
                        CursorAction::Delete => cursor
                            .delete(Box::new(|_| {}))
                            .map_err(transaction_error)?,
                        CursorAction::Stop => {
                            outcome.set(visited);
                            return Ok(());
                        }
                    }
                    cursor.continue_().map_err(transaction_error)
                },
            )
        })
        .await
    }

    /// Creates an object store by upgrading the database to the next
    /// version. `migrations` run in the same upgrade.
    ///
    /// Calls must not overlap with other schema changes on the same
    /// database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for invalid schemas or a database
    /// already at the highest version, and [`CoreError::Connection`] if
    /// the upgrade fails or is blocked.
    pub async fn create_object_store(
        &self,
        schema: StoreSchema,
        migrations: Option<MigrationFactory>,
    ) -> CoreResult<()> {
        schema.validate()?;
        let next = next_version(self.version().await?)?;
        let mut plan = UpgradePlan::new(vec![schema.clone()]);
        if let Some(factory) = migrations {
            plan = plan.with_factory(factory);
        }
        let conn = self.opener.open(&self.name, Some(next), Some(&plan)).await?;
        info!(database = %self.name, store = %schema.name, version = conn.version(), "object store created");
        let mut registry = self.registry.write();
        registry.set_version(&self.name, conn.version())?;
        registry.add_store(&self.name, schema)
    }

    /// Deletes an object store by upgrading the database to the next
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreNotFound`] for unknown stores,
    /// [`CoreError::Config`] for a database already at the highest
    /// version, and [`CoreError::Connection`] if the upgrade fails or is
    /// blocked.
    pub async fn delete_object_store(&self, store: &str) -> CoreResult<()> {
        let next = {
            let conn = self.connect().await?;
            if !conn.has_store(store) {
                return Err(CoreError::store_not_found(conn.name(), store));
            }
            next_version(conn.version())?
        };
        let plan = UpgradePlan::default().drop_store(store);
        let conn = self.opener.open(&self.name, Some(next), Some(&plan)).await?;
        info!(database = %self.name, store, version = conn.version(), "object store deleted");
        let mut registry = self.registry.write();
        registry.set_version(&self.name, conn.version())?;
        registry.remove_store(&self.name, store)
    }

    /// Deletes the database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DeleteBlocked`] if another connection stays
    /// open.
    pub async fn delete_database(&self) -> CoreResult<()> {
        self.opener.delete_database(&self.name).await
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
