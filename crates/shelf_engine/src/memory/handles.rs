//! Connection, transaction, cursor and upgrade handles of the memory engine.

use super::state::{CursorRecord, CursorState, Id};
use super::store::ObjectStoreState;
use super::Shared;
use crate::engine::{
    CursorCallback, EngineConnection, EngineCursor, EngineTransaction, RequestCallback, Task,
    TransactionCallbacks, UpgradeContext, VersionChangeHandler,
};
use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyPath, KeyRange};
use crate::types::{
    CursorDirection, IndexParameters, RequestTarget, StoreParameters, StoreRequest,
    TransactionMode,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) struct MemoryConnection {
    shared: Arc<Shared>,
    id: Id,
    name: String,
    version: u32,
}

impl MemoryConnection {
    pub(crate) fn new(shared: Arc<Shared>, id: Id, name: &str, version: u32) -> Self {
        Self {
            shared,
            id,
            name: name.to_string(),
            version,
        }
    }
}

impl EngineConnection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.shared.with_state(|state| {
            state
                .databases
                .get(&self.name)
                .map(|db| db.stores.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn transaction(
        &self,
        stores: &[String],
        mode: TransactionMode,
        callbacks: TransactionCallbacks,
    ) -> EngineResult<Arc<dyn EngineTransaction>> {
        let id = self.shared.with_state(|state| {
            if !state.on_loop_thread() {
                state.graveyard.push(Box::new(callbacks));
                return Err(EngineError::invalid_state(
                    "transactions can only be created on the engine event loop",
                ));
            }
            state.begin(self.id, stores, mode, callbacks)
        })?;
        Ok(Arc::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            id,
            mode,
        }))
    }

    fn dispatch(&self, task: Task) {
        self.shared.schedule(task);
    }

    fn close(&self) {
        trace!(database = %self.name, connection = self.id, "close requested");
        self.shared.with_state(|state| state.request_close(self.id));
    }

    fn set_on_version_change(&self, handler: VersionChangeHandler) {
        self.shared
            .with_state(|state| match state.connections.get_mut(&self.id) {
                Some(connection) => connection.on_version_change = Some(handler),
                None => state.graveyard.push(Box::new(handler)),
            });
    }
}

pub(crate) struct MemoryTransaction {
    shared: Arc<Shared>,
    id: Id,
    mode: TransactionMode,
}

impl MemoryTransaction {
    pub(crate) fn upgrade(shared: Arc<Shared>, id: Id) -> Self {
        Self {
            shared,
            id,
            mode: TransactionMode::VersionChange,
        }
    }
}

impl EngineTransaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn scope(&self) -> Vec<String> {
        self.shared.with_state(|state| {
            let Some(tx) = state.transactions.get(&self.id) else {
                return Vec::new();
            };
            if tx.mode == TransactionMode::VersionChange {
                return state
                    .databases
                    .get(&tx.database)
                    .map(|db| db.stores.keys().cloned().collect())
                    .unwrap_or_default();
            }
            tx.scope.clone()
        })
    }

    fn request(
        &self,
        target: RequestTarget,
        request: StoreRequest,
        callback: RequestCallback,
    ) -> EngineResult<()> {
        issue_request(&self.shared, self.id, target, request, callback)
    }

    fn open_cursor(
        &self,
        target: RequestTarget,
        range: Option<KeyRange>,
        direction: CursorDirection,
        key_only: bool,
        callback: CursorCallback,
    ) -> EngineResult<()> {
        let id = self.id;
        self.shared
            .with_state(|state| state.check_request(id, &target, false))?;

        let shared = Arc::clone(&self.shared);
        self.shared.with_state(|state| {
            let cursor = state.next_id();
            state.cursors.insert(
                cursor,
                CursorState {
                    transaction: id,
                    target,
                    range: range.unwrap_or_default(),
                    direction,
                    key_only,
                    position: None,
                    advanced: true,
                    callback: Some(callback),
                },
            );
            state.push_request(id, Box::new(move || run_cursor_step(&shared, id, cursor, 1)));
        });
        Ok(())
    }

    fn commit(&self) -> EngineResult<()> {
        self.shared
            .with_state(|state| match state.transactions.get_mut(&self.id) {
                Some(tx) => {
                    tx.commit_requested = true;
                    // the loop settles transactions after each task
                    state.queue.push_back(Box::new(|| {}));
                    Ok(())
                }
                None => Err(EngineError::invalid_state("transaction already finished")),
            })
    }

    fn abort(&self) -> EngineResult<()> {
        self.shared.with_state(|state| {
            if !state.transactions.contains_key(&self.id) {
                return Err(EngineError::invalid_state("transaction already finished"));
            }
            state.abort(self.id, EngineError::aborted("transaction aborted by caller"));
            Ok(())
        })
    }
}

fn issue_request(
    shared: &Arc<Shared>,
    id: Id,
    target: RequestTarget,
    request: StoreRequest,
    callback: RequestCallback,
) -> EngineResult<()> {
    let is_write = request.is_write();
    shared.with_state(|state| state.check_request(id, &target, is_write))?;

    let runner = Arc::clone(shared);
    let task: Task = Box::new(move || run_request(&runner, id, target, request, callback));
    shared.with_state(|state| state.push_request(id, task));
    Ok(())
}

fn run_request(
    shared: &Arc<Shared>,
    id: Id,
    target: RequestTarget,
    request: StoreRequest,
    callback: RequestCallback,
) {
    let (result, alive) = shared.with_state(|state| {
        let alive = state.transactions.contains_key(&id);
        let result = state.execute(id, &target, request);
        state.set_active(id, true);
        (result, alive)
    });
    let failure = result.as_ref().err().cloned();
    trace!(transaction = id, ok = failure.is_none(), "request finished");

    callback(result);

    shared.with_state(|state| state.request_done(id));
    if let (Some(err), true) = (failure, alive) {
        fail_transaction(shared, id, err);
    }
}

/// Reports a failed request to the transaction's error handler, then aborts.
fn fail_transaction(shared: &Arc<Shared>, id: Id, err: EngineError) {
    let handler = shared.with_state(|state| state.take_error_handler(id));
    if let Some(mut handler) = handler {
        handler(err.clone());
        shared.with_state(|state| state.restore_error_handler(id, handler));
    }
    shared.with_state(|state| state.abort(id, err));
}

fn run_cursor_step(shared: &Arc<Shared>, tx: Id, cursor: Id, count: u32) {
    let step = shared.with_state(|state| {
        let outcome = state.cursor_step(cursor, count)?;
        let callback = state
            .cursors
            .get_mut(&cursor)
            .and_then(|c| c.callback.take());
        state.set_active(tx, true);
        Some((outcome, callback))
    });
    let Some((outcome, Some(mut callback))) = step else {
        shared.with_state(|state| state.request_done(tx));
        return;
    };

    let failure = outcome.as_ref().err().cloned();
    let finished = !matches!(outcome, Ok(Some(_)));
    match outcome {
        Ok(Some(record)) => {
            let handle = MemoryCursor {
                shared: Arc::clone(shared),
                transaction: tx,
                cursor,
                record,
            };
            let handle: &dyn EngineCursor = &handle;
            callback(Ok(Some(handle)));
        }
        Ok(None) => callback(Ok(None)),
        Err(err) => callback(Err(err)),
    }

    shared.with_state(|state| {
        state.request_done(tx);
        if finished {
            if let Some(done) = state.cursors.remove(&cursor) {
                state.graveyard.push(Box::new(done.callback));
            }
            state.graveyard.push(Box::new(callback));
        } else {
            match state.cursors.get_mut(&cursor) {
                Some(live) => live.callback = Some(callback),
                None => state.graveyard.push(Box::new(callback)),
            }
        }
    });
    if let Some(err) = failure {
        fail_transaction(shared, tx, err);
    }
}

struct MemoryCursor {
    shared: Arc<Shared>,
    transaction: Id,
    cursor: Id,
    record: CursorRecord,
}

impl MemoryCursor {
    fn store_name(&self) -> EngineResult<String> {
        self.shared.with_state(|state| {
            state
                .cursors
                .get(&self.cursor)
                .map(|c| c.target.store_name().to_string())
                .ok_or_else(|| EngineError::invalid_state("cursor is finished"))
        })
    }

    fn writable(&self) -> EngineResult<()> {
        if self.record.value.is_none() {
            return Err(EngineError::invalid_state(
                "key-only cursors cannot modify records",
            ));
        }
        Ok(())
    }
}

impl EngineCursor for MemoryCursor {
    fn key(&self) -> &Key {
        &self.record.key
    }

    fn primary_key(&self) -> &Key {
        &self.record.primary_key
    }

    fn value(&self) -> Option<&Value> {
        self.record.value.as_ref()
    }

    fn continue_(&self) -> EngineResult<()> {
        self.advance(1)
    }

    fn advance(&self, count: u32) -> EngineResult<()> {
        if count == 0 {
            return Err(EngineError::InvalidAccess(
                "cursor advance count must be positive".into(),
            ));
        }
        let (tx, cursor) = (self.transaction, self.cursor);
        let shared = Arc::clone(&self.shared);
        self.shared.with_state(|state| {
            let active = state.transactions.get(&tx).map_or(false, |t| t.active);
            if !active {
                return Err(EngineError::TransactionInactive);
            }
            let live = state
                .cursors
                .get_mut(&cursor)
                .ok_or_else(|| EngineError::invalid_state("cursor is finished"))?;
            if live.advanced {
                return Err(EngineError::invalid_state("cursor was already advanced"));
            }
            live.advanced = true;
            state.push_request(
                tx,
                Box::new(move || run_cursor_step(&shared, tx, cursor, count)),
            );
            Ok(())
        })
    }

    fn update(&self, value: Value, callback: RequestCallback) -> EngineResult<()> {
        self.writable()?;
        let store = self.store_name()?;
        let primary = self.record.primary_key.clone();
        let inline = self.shared.with_state(|state| {
            let database = state
                .transactions
                .get(&self.transaction)
                .map(|tx| tx.database.clone())
                .ok_or(EngineError::TransactionInactive)?;
            state
                .databases
                .get(&database)
                .and_then(|db| db.stores.get(&store))
                .map(|s| s.key_path.clone())
                .ok_or_else(|| EngineError::not_found(format!("object store {store}")))
        })?;
        let key = match inline {
            Some(path) => {
                if path.extract(&value)?.as_ref() != Some(&primary) {
                    return Err(EngineError::data(
                        "cursor update must keep the record's key",
                    ));
                }
                None
            }
            None => Some(primary),
        };
        issue_request(
            &self.shared,
            self.transaction,
            RequestTarget::Store(store),
            StoreRequest::Put { value, key },
            callback,
        )
    }

    fn delete(&self, callback: RequestCallback) -> EngineResult<()> {
        self.writable()?;
        let store = self.store_name()?;
        issue_request(
            &self.shared,
            self.transaction,
            RequestTarget::Store(store),
            StoreRequest::Delete(KeyRange::only(self.record.primary_key.clone())),
            callback,
        )
    }
}

pub(crate) struct MemoryUpgrade {
    shared: Arc<Shared>,
    database: String,
    connection: Arc<dyn EngineConnection>,
    transaction: Arc<MemoryTransaction>,
    old_version: u32,
    new_version: u32,
}

impl MemoryUpgrade {
    pub(crate) fn new(
        shared: Arc<Shared>,
        database: String,
        connection: Arc<dyn EngineConnection>,
        transaction: Arc<MemoryTransaction>,
        old_version: u32,
        new_version: u32,
    ) -> Self {
        Self {
            shared,
            database,
            connection,
            transaction,
            old_version,
            new_version,
        }
    }

    fn with_stores<R>(
        &self,
        f: impl FnOnce(&mut std::collections::BTreeMap<String, ObjectStoreState>) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let tx = self.transaction.id;
        self.shared.with_state(|state| {
            if !state.transactions.contains_key(&tx) {
                return Err(EngineError::invalid_state("upgrade transaction has finished"));
            }
            let db = state
                .databases
                .get_mut(&self.database)
                .ok_or_else(|| EngineError::not_found(format!("database {}", self.database)))?;
            f(&mut db.stores)
        })
    }
}

impl UpgradeContext for MemoryUpgrade {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn connection(&self) -> Arc<dyn EngineConnection> {
        Arc::clone(&self.connection)
    }

    fn transaction(&self) -> Arc<dyn EngineTransaction> {
        self.transaction.clone()
    }

    fn object_store_names(&self) -> Vec<String> {
        self.connection.object_store_names()
    }

    fn index_names(&self, store: &str) -> EngineResult<Vec<String>> {
        self.with_stores(|stores| {
            stores
                .get(store)
                .map(|s| s.indexes.keys().cloned().collect())
                .ok_or_else(|| EngineError::not_found(format!("object store {store}")))
        })
    }

    fn create_object_store(&self, name: &str, params: &StoreParameters) -> EngineResult<()> {
        self.with_stores(|stores| {
            if stores.contains_key(name) {
                return Err(EngineError::constraint(format!(
                    "object store {name} already exists"
                )));
            }
            stores.insert(name.to_string(), ObjectStoreState::new(name, params)?);
            Ok(())
        })?;
        debug!(database = %self.database, store = name, "object store created");
        Ok(())
    }

    fn delete_object_store(&self, name: &str) -> EngineResult<()> {
        let removed = self.with_stores(|stores| {
            stores
                .remove(name)
                .ok_or_else(|| EngineError::not_found(format!("object store {name}")))
        })?;
        debug!(database = %self.database, store = name, records = removed.records.len(), "object store deleted");
        Ok(())
    }

    fn create_index(
        &self,
        store: &str,
        name: &str,
        key_path: &KeyPath,
        params: &IndexParameters,
    ) -> EngineResult<()> {
        self.with_stores(|stores| {
            stores
                .get_mut(store)
                .ok_or_else(|| EngineError::not_found(format!("object store {store}")))?
                .create_index(name, key_path, params)
        })
    }

    fn delete_index(&self, store: &str, name: &str) -> EngineResult<()> {
        self.with_stores(|stores| {
            stores
                .get_mut(store)
                .ok_or_else(|| EngineError::not_found(format!("object store {store}")))?
                .indexes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| EngineError::not_found(format!("index {name} on {store}")))
        })
    }
}
