//! Bookkeeping of the memory engine: databases, connections, transactions
//! and cursors, all guarded by one mutex.
//!
//! Nothing in here calls user code. Callbacks are either queued as tasks
//! for the event loop or moved to the graveyard, which is emptied after the
//! lock is released.

use super::store::{Change, ObjectStoreState};
use crate::engine::{
    CursorCallback, EngineConnection, ErrorCallback, SuccessCallback, Task, TransactionCallbacks,
    VersionChangeHandler,
};
use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyRange};
use crate::types::{CursorDirection, RequestOutput, RequestTarget, StoreRequest, TransactionMode};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::trace;

pub(crate) type Id = u64;

#[derive(Debug, Clone, Default)]
pub(crate) struct DatabaseState {
    pub version: u32,
    pub stores: BTreeMap<String, ObjectStoreState>,
    pub upgrading: bool,
}

pub(crate) struct ConnectionState {
    pub database: String,
    pub close_requested: bool,
    pub on_version_change: Option<VersionChangeHandler>,
}

struct UndoEntry {
    store: String,
    change: Change,
}

/// Database contents before an upgrade started.
pub(crate) struct Snapshot {
    pub existed: bool,
    pub database: DatabaseState,
}

/// The open request waiting on an upgrade transaction.
pub(crate) struct PendingOpen {
    pub connection: Arc<dyn EngineConnection>,
    pub on_success: SuccessCallback,
    pub on_error: ErrorCallback,
}

pub(crate) struct TransactionState {
    pub connection: Id,
    pub database: String,
    pub mode: TransactionMode,
    pub scope: Vec<String>,
    pub active: bool,
    pub started: bool,
    pub commit_requested: bool,
    pub pending: usize,
    waiting: VecDeque<Task>,
    undo: Vec<UndoEntry>,
    snapshot: Option<Snapshot>,
    callbacks: Option<TransactionCallbacks>,
    upgrade: Option<PendingOpen>,
}

impl TransactionState {
    fn overlaps(&self, other: &TransactionState) -> bool {
        self.database == other.database
            && (self.mode == TransactionMode::VersionChange
                || other.mode == TransactionMode::VersionChange
                || self.scope.iter().any(|store| other.scope.contains(store)))
    }
}

pub(crate) struct CursorState {
    pub transaction: Id,
    pub target: RequestTarget,
    pub range: KeyRange,
    pub direction: CursorDirection,
    pub key_only: bool,
    pub position: Option<(Key, Key)>,
    pub advanced: bool,
    pub callback: Option<CursorCallback>,
}

/// The record under a cursor after a step.
#[derive(Debug, Clone)]
pub(crate) struct CursorRecord {
    pub key: Key,
    pub primary_key: Key,
    pub value: Option<Value>,
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub shutdown: bool,
    pub loop_thread: Option<ThreadId>,
    pub queue: VecDeque<Task>,
    pub deferred: Vec<Task>,
    pub databases: BTreeMap<String, DatabaseState>,
    pub connections: HashMap<Id, ConnectionState>,
    pub transactions: BTreeMap<Id, TransactionState>,
    pub cursors: HashMap<Id, CursorState>,
    pub graveyard: Vec<Box<dyn Any + Send>>,
    next_id: Id,
}

impl EngineState {
    pub fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    pub fn on_loop_thread(&self) -> bool {
        self.loop_thread == Some(std::thread::current().id())
    }

    /// Puts deferred opens and deletes back on the queue so they can check
    /// their preconditions again.
    pub fn requeue_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        self.queue.extend(deferred);
    }

    pub fn new_connection(&mut self, database: &str) -> Id {
        let id = self.next_id();
        self.connections.insert(
            id,
            ConnectionState {
                database: database.to_string(),
                close_requested: false,
                on_version_change: None,
            },
        );
        id
    }

    /// Connections to `database` that have not been asked to close.
    pub fn open_connections(&self, database: &str) -> Vec<Id> {
        self.connections
            .iter()
            .filter(|(_, c)| c.database == database && !c.close_requested)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Connections to `database` that are closing but still finishing
    /// transactions.
    pub fn closing_connections(&self, database: &str) -> usize {
        self.connections
            .values()
            .filter(|c| c.database == database && c.close_requested)
            .count()
    }

    pub fn request_close(&mut self, connection: Id) {
        if let Some(state) = self.connections.get_mut(&connection) {
            state.close_requested = true;
        }
        self.release_if_idle(connection);
    }

    fn release_if_idle(&mut self, connection: Id) {
        let closing = self
            .connections
            .get(&connection)
            .map_or(false, |c| c.close_requested);
        let busy = self
            .transactions
            .values()
            .any(|tx| tx.connection == connection);
        if closing && !busy {
            if let Some(state) = self.connections.remove(&connection) {
                self.graveyard.push(Box::new(state.on_version_change));
            }
            trace!(connection, "connection closed");
            self.requeue_deferred();
        }
    }

    /// Registers a new transaction. The caller has checked that the call
    /// comes from the event loop.
    pub fn begin(
        &mut self,
        connection: Id,
        stores: &[String],
        mode: TransactionMode,
        callbacks: TransactionCallbacks,
    ) -> EngineResult<Id> {
        let (database, scope) = match self.resolve_scope(connection, stores, mode) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.graveyard.push(Box::new(callbacks));
                return Err(err);
            }
        };
        let id = self.next_id();
        trace!(transaction = id, ?mode, ?scope, "transaction created");
        self.transactions.insert(
            id,
            TransactionState {
                connection,
                database,
                mode,
                scope,
                active: true,
                started: false,
                commit_requested: false,
                pending: 0,
                waiting: VecDeque::new(),
                undo: Vec::new(),
                snapshot: None,
                callbacks: Some(callbacks),
                upgrade: None,
            },
        );
        Ok(id)
    }

    fn resolve_scope(
        &self,
        connection: Id,
        stores: &[String],
        mode: TransactionMode,
    ) -> EngineResult<(String, Vec<String>)> {
        let conn = self
            .connections
            .get(&connection)
            .filter(|c| !c.close_requested)
            .ok_or_else(|| EngineError::invalid_state("connection is closed"))?;
        let database = self
            .databases
            .get(&conn.database)
            .ok_or_else(|| EngineError::invalid_state("database was deleted"))?;
        if database.upgrading {
            return Err(EngineError::invalid_state(
                "database is being upgraded on this connection",
            ));
        }
        if mode == TransactionMode::VersionChange {
            return Err(EngineError::InvalidAccess(
                "version change transactions are created by upgrades only".into(),
            ));
        }
        if stores.is_empty() {
            return Err(EngineError::InvalidAccess(
                "transaction scope must name at least one object store".into(),
            ));
        }
        let mut scope = Vec::with_capacity(stores.len());
        for store in stores {
            if !database.stores.contains_key(store) {
                return Err(EngineError::not_found(format!("object store {store}")));
            }
            if !scope.contains(store) {
                scope.push(store.clone());
            }
        }
        Ok((conn.database.clone(), scope))
    }

    /// Registers the version change transaction of an upgrade. It starts
    /// immediately: opens wait until no other connection is left.
    pub fn begin_upgrade(
        &mut self,
        connection: Id,
        database: &str,
        snapshot: Snapshot,
        open: PendingOpen,
    ) -> Id {
        let state = TransactionState {
            connection,
            database: database.to_string(),
            mode: TransactionMode::VersionChange,
            scope: Vec::new(),
            active: true,
            started: true,
            commit_requested: false,
            pending: 0,
            waiting: VecDeque::new(),
            undo: Vec::new(),
            snapshot: Some(snapshot),
            callbacks: None,
            upgrade: Some(open),
        };
        let id = self.next_id();
        self.transactions.insert(id, state);
        id
    }

    /// Checks that a request may be issued now.
    pub fn check_request(
        &self,
        id: Id,
        target: &RequestTarget,
        is_write: bool,
    ) -> EngineResult<()> {
        let tx = self
            .transactions
            .get(&id)
            .filter(|tx| tx.active)
            .ok_or(EngineError::TransactionInactive)?;
        if tx.commit_requested {
            return Err(EngineError::invalid_state("transaction is committing"));
        }
        let store_name = target.store_name();
        if is_write && !tx.mode.is_write() {
            return Err(EngineError::ReadOnly(store_name.to_string()));
        }
        let in_scope =
            tx.mode == TransactionMode::VersionChange || tx.scope.iter().any(|s| s == store_name);
        let store = self
            .databases
            .get(&tx.database)
            .and_then(|db| db.stores.get(store_name))
            .filter(|_| in_scope)
            .ok_or_else(|| {
                EngineError::not_found(format!("object store {store_name} in transaction scope"))
            })?;
        if let RequestTarget::Index { index, .. } = target {
            if !store.indexes.contains_key(index) {
                return Err(EngineError::not_found(format!(
                    "index {index} on object store {store_name}"
                )));
            }
        }
        Ok(())
    }

    /// Counts a request against the transaction and schedules it, or parks
    /// it until the transaction starts.
    pub fn push_request(&mut self, id: Id, task: Task) {
        match self.transactions.get_mut(&id) {
            Some(tx) if tx.started => {
                tx.pending += 1;
                self.queue.push_back(task);
            }
            Some(tx) => {
                tx.pending += 1;
                tx.waiting.push_back(task);
            }
            None => self.queue.push_back(task),
        }
    }

    /// Marks a request as finished.
    pub fn request_done(&mut self, id: Id) {
        if let Some(tx) = self.transactions.get_mut(&id) {
            tx.active = false;
            tx.pending = tx.pending.saturating_sub(1);
        }
    }

    pub fn set_active(&mut self, id: Id, active: bool) {
        if let Some(tx) = self.transactions.get_mut(&id) {
            tx.active = active;
        }
    }

    /// Takes the per-request error handler so it can run unlocked.
    pub fn take_error_handler(&mut self, id: Id) -> Option<Box<dyn FnMut(EngineError) + Send>> {
        self.transactions
            .get_mut(&id)?
            .callbacks
            .as_mut()?
            .on_error
            .take()
    }

    pub fn restore_error_handler(&mut self, id: Id, handler: Box<dyn FnMut(EngineError) + Send>) {
        match self
            .transactions
            .get_mut(&id)
            .and_then(|tx| tx.callbacks.as_mut())
        {
            Some(callbacks) => callbacks.on_error = Some(handler),
            None => self.graveyard.push(Box::new(handler)),
        }
    }

    /// Runs a request against the data.
    pub fn execute(
        &mut self,
        id: Id,
        target: &RequestTarget,
        request: StoreRequest,
    ) -> EngineResult<RequestOutput> {
        let tx = self
            .transactions
            .get(&id)
            .ok_or_else(|| EngineError::aborted("transaction already finished"))?;
        let database = tx.database.clone();
        let log_undo = tx.snapshot.is_none();
        let store_name = target.store_name().to_string();
        let store = self
            .databases
            .get_mut(&database)
            .and_then(|db| db.stores.get_mut(&store_name))
            .ok_or_else(|| EngineError::not_found(format!("object store {store_name}")))?;
        let index = match target {
            RequestTarget::Index { index, .. } => Some(index.as_str()),
            RequestTarget::Store(_) => None,
        };

        let mut changes = Vec::new();
        let result = store.execute(index, request, &mut changes);
        if log_undo {
            if let Some(tx) = self.transactions.get_mut(&id) {
                tx.undo.extend(changes.into_iter().map(|change| UndoEntry {
                    store: store_name.clone(),
                    change,
                }));
            }
        }
        result
    }

    /// Moves a cursor `count` steps. Returns `None` if the cursor is gone.
    pub fn cursor_step(
        &mut self,
        cursor_id: Id,
        count: u32,
    ) -> Option<EngineResult<Option<CursorRecord>>> {
        let cursor = self.cursors.get(&cursor_id)?;
        let Some(tx) = self.transactions.get(&cursor.transaction) else {
            return Some(Err(EngineError::aborted("transaction already finished")));
        };
        let store_name = cursor.target.store_name();
        let Some(store) = self
            .databases
            .get(&tx.database)
            .and_then(|db| db.stores.get(store_name))
        else {
            return Some(Err(EngineError::not_found(format!(
                "object store {store_name}"
            ))));
        };

        let entries: Vec<(Key, Key)> = match &cursor.target {
            RequestTarget::Store(_) => store
                .records
                .range(cursor.range.bounds())
                .map(|(key, _)| (key.clone(), key.clone()))
                .collect(),
            RequestTarget::Index { index, .. } => {
                match store.index_entries(index, Some(&cursor.range)) {
                    Ok(entries) => entries,
                    Err(err) => return Some(Err(err)),
                }
            }
        };

        let mut position = cursor.position.clone();
        let mut found = None;
        for _ in 0..count.max(1) {
            found = next_entry(&entries, position.as_ref(), cursor.direction);
            match &found {
                Some(entry) => position = Some(entry.clone()),
                None => break,
            }
        }
        let record = found.map(|(key, primary_key)| CursorRecord {
            value: if cursor.key_only {
                None
            } else {
                store.records.get(&primary_key).cloned()
            },
            key,
            primary_key,
        });

        if let Some(cursor) = self.cursors.get_mut(&cursor_id) {
            cursor.position = position;
            cursor.advanced = false;
        }
        Some(Ok(record))
    }

    /// Deactivates transactions after a task, starts those whose locks are
    /// free and commits those with nothing left to do.
    pub fn settle(&mut self) {
        for tx in self.transactions.values_mut() {
            tx.active = false;
        }
        loop {
            let ids: Vec<Id> = self.transactions.keys().copied().collect();
            let mut progressed = false;
            for id in &ids {
                let waiting = matches!(self.transactions.get(id), Some(tx) if !tx.started);
                if waiting && self.can_start(*id) {
                    self.start(*id);
                    progressed = true;
                }
            }
            for id in ids {
                let idle = matches!(
                    self.transactions.get(&id),
                    Some(tx) if tx.started && tx.pending == 0
                );
                if idle {
                    self.commit(id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn can_start(&self, id: Id) -> bool {
        let Some(tx) = self.transactions.get(&id) else {
            return false;
        };
        !self.transactions.range(..id).any(|(_, earlier)| {
            tx.overlaps(earlier) && (tx.mode.is_write() || earlier.mode.is_write())
        })
    }

    fn start(&mut self, id: Id) {
        if let Some(tx) = self.transactions.get_mut(&id) {
            tx.started = true;
            let waiting = std::mem::take(&mut tx.waiting);
            self.queue.extend(waiting);
            trace!(transaction = id, "transaction started");
        }
    }

    fn drop_cursors_of(&mut self, id: Id) {
        let doomed: Vec<Id> = self
            .cursors
            .iter()
            .filter(|(_, c)| c.transaction == id)
            .map(|(cursor, _)| *cursor)
            .collect();
        for cursor in doomed {
            if let Some(state) = self.cursors.remove(&cursor) {
                self.graveyard.push(Box::new(state.callback));
            }
        }
    }

    fn commit(&mut self, id: Id) {
        let Some(mut tx) = self.transactions.remove(&id) else {
            return;
        };
        self.drop_cursors_of(id);
        if let Some(open) = tx.upgrade.take() {
            if let Some(db) = self.databases.get_mut(&tx.database) {
                db.upgrading = false;
            }
            let PendingOpen {
                connection,
                on_success,
                on_error,
            } = open;
            self.graveyard.push(Box::new(on_error));
            self.queue.push_back(Box::new(move || on_success(connection)));
            self.requeue_deferred();
        }
        if let Some(callbacks) = tx.callbacks.take() {
            self.queue.push_back(callbacks.on_complete);
            self.graveyard.push(Box::new(callbacks.on_error));
            self.graveyard.push(Box::new(callbacks.on_abort));
        }
        trace!(transaction = id, "transaction committed");
        let connection = tx.connection;
        self.graveyard.push(Box::new(tx));
        self.release_if_idle(connection);
    }

    /// Rolls back and finishes a transaction. Parked and queued requests
    /// fail with an abort error when they run.
    pub fn abort(&mut self, id: Id, error: EngineError) {
        let Some(mut tx) = self.transactions.remove(&id) else {
            return;
        };
        self.drop_cursors_of(id);

        match tx.snapshot.take() {
            Some(snapshot) if snapshot.existed => {
                self.databases.insert(tx.database.clone(), snapshot.database);
            }
            Some(_) => {
                self.databases.remove(&tx.database);
            }
            None => {
                if let Some(db) = self.databases.get_mut(&tx.database) {
                    for entry in tx.undo.drain(..).rev() {
                        if let Some(store) = db.stores.get_mut(&entry.store) {
                            store.undo(entry.change);
                        }
                    }
                }
            }
        }
        let waiting = std::mem::take(&mut tx.waiting);
        self.queue.extend(waiting);

        if let Some(open) = tx.upgrade.take() {
            if let Some(state) = self.connections.remove(&tx.connection) {
                self.graveyard.push(Box::new(state.on_version_change));
            }
            let PendingOpen {
                connection,
                on_success,
                on_error,
            } = open;
            self.graveyard.push(Box::new(connection));
            self.graveyard.push(Box::new(on_success));
            let cause = error.clone();
            self.queue.push_back(Box::new(move || on_error(cause)));
            self.requeue_deferred();
        }
        if let Some(callbacks) = tx.callbacks.take() {
            let on_abort = callbacks.on_abort;
            self.queue.push_back(Box::new(move || on_abort(error)));
            self.graveyard.push(Box::new(callbacks.on_complete));
            self.graveyard.push(Box::new(callbacks.on_error));
        }
        trace!(transaction = id, "transaction aborted");
        let connection = tx.connection;
        self.graveyard.push(Box::new(tx));
        self.release_if_idle(connection);
    }
}

fn next_entry(
    entries: &[(Key, Key)],
    position: Option<&(Key, Key)>,
    direction: CursorDirection,
) -> Option<(Key, Key)> {
    match direction {
        CursorDirection::Next => entries
            .iter()
            .find(|entry| position.map_or(true, |p| *entry > p))
            .cloned(),
        CursorDirection::NextUnique => entries
            .iter()
            .find(|(key, _)| position.map_or(true, |(p, _)| key > p))
            .cloned(),
        CursorDirection::Prev => entries
            .iter()
            .rev()
            .find(|entry| position.map_or(true, |p| *entry < p))
            .cloned(),
        CursorDirection::PrevUnique => {
            let (key, _) = entries
                .iter()
                .rev()
                .find(|(key, _)| position.map_or(true, |(p, _)| key < p))?;
            entries.iter().find(|(k, _)| k == key).cloned()
        }
    }
}
