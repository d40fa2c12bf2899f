//! In-memory engine with IndexedDB semantics.

mod handles;
mod state;
mod store;

use crate::engine::{
    DatabasesCallback, DeleteCallbacks, EngineConnection, EngineFactory, OpenCallbacks, Task,
    VersionChangeHandler,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{DatabaseInfo, VersionChange};
use handles::{MemoryConnection, MemoryTransaction, MemoryUpgrade};
use parking_lot::{Condvar, Mutex};
use state::{EngineState, Id, PendingOpen, Snapshot};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Shared {
    state: Mutex<EngineState>,
    wake: Condvar,
}

impl Shared {
    /// Runs `f` under the lock, then wakes the loop if work was queued and
    /// drops discarded callbacks outside the lock.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        let garbage = std::mem::take(&mut state.graveyard);
        let has_work = !state.queue.is_empty();
        drop(state);
        if has_work {
            self.wake.notify_one();
        }
        drop(garbage);
        result
    }

    fn schedule(&self, task: Task) {
        self.with_state(|state| state.queue.push_back(task));
    }
}

struct LoopGuard {
    shared: Arc<Shared>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
    }
}

/// An in-memory engine.
///
/// All callbacks run on one dedicated event-loop thread, one task at a
/// time, in the order the engine queued them. Data lives as long as the
/// engine; clones share it. The loop stops when the last clone is dropped,
/// and pending callbacks are discarded.
///
/// This engine is suitable for:
/// - Unit and integration tests
/// - Command line tools working on throwaway data
/// - Hosts without a native object store
///
/// # Example
///
/// ```rust
/// use shelf_engine::{EngineFactory, MemoryEngine, OpenCallbacks};
/// use std::sync::mpsc;
///
/// let engine = MemoryEngine::new().unwrap();
/// let (tx, rx) = mpsc::channel();
/// let err_tx = tx.clone();
/// engine.open(
///     "notes",
///     Some(1),
///     OpenCallbacks::new(
///         move |conn| tx.send(Ok(conn.version())).unwrap(),
///         move |err| err_tx.send(Err(err)).unwrap(),
///     ),
/// );
/// assert_eq!(rx.recv().unwrap().unwrap(), 1);
/// ```
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
    _guard: Arc<LoopGuard>,
}

impl MemoryEngine {
    /// Creates an empty engine and starts its event loop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotAvailable`] if the loop thread cannot be
    /// spawned.
    pub fn new() -> EngineResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState::default()),
            wake: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("shelf-memory-engine".into())
            .spawn(move || run_loop(loop_shared))
            .map_err(|e| EngineError::NotAvailable(format!("cannot start event loop: {e}")))?;
        shared.state.lock().loop_thread = Some(handle.thread().id());
        debug!("memory engine started");
        Ok(Self {
            _guard: Arc::new(LoopGuard {
                shared: Arc::clone(&shared),
            }),
            shared,
        })
    }

    /// Names and versions of the stored databases, read synchronously.
    #[must_use]
    pub fn snapshot_databases(&self) -> Vec<DatabaseInfo> {
        self.shared.with_state(|state| list_databases(state))
    }
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("databases", &self.snapshot_databases())
            .finish()
    }
}

fn list_databases(state: &EngineState) -> Vec<DatabaseInfo> {
    state
        .databases
        .iter()
        .filter(|(_, db)| db.version > 0)
        .map(|(name, db)| DatabaseInfo {
            name: name.clone(),
            version: db.version,
        })
        .collect()
}

impl EngineFactory for MemoryEngine {
    fn open(&self, name: &str, version: Option<u32>, callbacks: OpenCallbacks) {
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        self.shared
            .schedule(Box::new(move || run_open(&shared, name, version, callbacks)));
    }

    fn delete_database(&self, name: &str, callbacks: DeleteCallbacks) {
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        self.shared
            .schedule(Box::new(move || run_delete(&shared, name, callbacks)));
    }

    fn databases(&self, callback: DatabasesCallback) {
        let shared = Arc::clone(&self.shared);
        self.shared.schedule(Box::new(move || {
            let list = shared.with_state(|state| list_databases(state));
            callback(Ok(list));
        }));
    }
}

fn run_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    let leftovers = std::mem::take(&mut *state);
                    state.shutdown = true;
                    drop(state);
                    drop(leftovers);
                    debug!("memory engine stopped");
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                shared.wake.wait(&mut state);
            }
        };
        task();
        shared.with_state(EngineState::settle);
    }
}

enum OpenStep {
    Defer,
    Fail(EngineError),
    Ready(Arc<dyn EngineConnection>),
    Upgrade { current: u32, requested: u32 },
}

enum Gate {
    Proceed,
    Wait,
    Blocked(usize),
}

fn run_open(shared: &Arc<Shared>, name: String, version: Option<u32>, callbacks: OpenCallbacks) {
    if version == Some(0) {
        (callbacks.on_error)(EngineError::InvalidAccess(
            "database version must be at least 1".into(),
        ));
        return;
    }

    let step = shared.with_state(|state| {
        let existing = state.databases.get(&name);
        if existing.map_or(false, |db| db.upgrading) {
            return OpenStep::Defer;
        }
        let current = existing.map_or(0, |db| db.version);
        let requested = version.unwrap_or(current.max(1));
        if requested < current {
            return OpenStep::Fail(EngineError::VersionTooLow { requested, current });
        }
        if requested > current {
            return OpenStep::Upgrade { current, requested };
        }
        let id = state.new_connection(&name);
        OpenStep::Ready(Arc::new(MemoryConnection::new(
            Arc::clone(shared),
            id,
            &name,
            current,
        )))
    });

    match step {
        OpenStep::Defer => defer_open(shared, name, version, callbacks),
        OpenStep::Fail(err) => (callbacks.on_error)(err),
        OpenStep::Ready(connection) => (callbacks.on_success)(connection),
        OpenStep::Upgrade { current, requested } => {
            let change = VersionChange {
                old_version: current,
                new_version: Some(requested),
            };
            match wait_for_exclusive_access(shared, &name, change) {
                Gate::Wait => defer_open(shared, name, version, callbacks),
                Gate::Blocked(open_connections) => {
                    warn!(database = %name, open_connections, "upgrade blocked");
                    if let Some(on_blocked) = callbacks.on_blocked {
                        on_blocked(change);
                    }
                    (callbacks.on_error)(EngineError::Blocked {
                        database: name,
                        open_connections,
                    });
                }
                Gate::Proceed => start_upgrade(shared, name, current, requested, callbacks),
            }
        }
    }
}

fn defer_open(shared: &Arc<Shared>, name: String, version: Option<u32>, callbacks: OpenCallbacks) {
    let retry = Arc::clone(shared);
    shared.with_state(|state| {
        state
            .deferred
            .push(Box::new(move || run_open(&retry, name, version, callbacks)));
    });
}

/// Tells other connections about the version change, then decides whether
/// the caller may go ahead, must wait for closing connections, or is
/// blocked by connections that stayed open.
fn wait_for_exclusive_access(shared: &Arc<Shared>, name: &str, change: VersionChange) -> Gate {
    let handlers: Vec<(Id, VersionChangeHandler)> = shared.with_state(|state| {
        state
            .open_connections(name)
            .into_iter()
            .filter_map(|id| {
                let handler = state.connections.get_mut(&id)?.on_version_change.take()?;
                Some((id, handler))
            })
            .collect()
    });

    let mut notified = Vec::with_capacity(handlers.len());
    for (id, mut handler) in handlers {
        handler(change);
        notified.push((id, handler));
    }

    shared.with_state(|state| {
        for (id, handler) in notified {
            match state.connections.get_mut(&id) {
                Some(connection) => connection.on_version_change = Some(handler),
                None => state.graveyard.push(Box::new(handler)),
            }
        }
        let open = state.open_connections(name).len();
        if open > 0 {
            Gate::Blocked(open)
        } else if state.closing_connections(name) > 0 {
            Gate::Wait
        } else {
            Gate::Proceed
        }
    })
}

fn start_upgrade(
    shared: &Arc<Shared>,
    name: String,
    current: u32,
    requested: u32,
    callbacks: OpenCallbacks,
) {
    let OpenCallbacks {
        on_upgrade_needed,
        on_success,
        on_error,
        ..
    } = callbacks;

    let (connection, transaction) = shared.with_state(|state| {
        let existing = state.databases.get(&name).cloned();
        let snapshot = Snapshot {
            existed: existing.is_some(),
            database: existing.unwrap_or_default(),
        };
        let db = state.databases.entry(name.clone()).or_default();
        db.version = requested;
        db.upgrading = true;

        let connection_id = state.new_connection(&name);
        let connection: Arc<dyn EngineConnection> = Arc::new(MemoryConnection::new(
            Arc::clone(shared),
            connection_id,
            &name,
            requested,
        ));
        let open = PendingOpen {
            connection: Arc::clone(&connection),
            on_success,
            on_error,
        };
        let transaction = state.begin_upgrade(connection_id, &name, snapshot, open);
        (connection, transaction)
    });

    debug!(database = %name, old_version = current, new_version = requested, "upgrade needed");
    let context = MemoryUpgrade::new(
        Arc::clone(shared),
        name,
        connection,
        Arc::new(MemoryTransaction::upgrade(Arc::clone(shared), transaction)),
        current,
        requested,
    );
    if let Some(upgrade) = on_upgrade_needed {
        if let Err(err) = upgrade(&context) {
            debug!(error = %err, "upgrade callback failed, aborting");
            shared.with_state(|state| state.abort(transaction, err));
        }
    }
}

enum DeleteStep {
    Missing,
    Defer,
    Present(u32),
}

fn run_delete(shared: &Arc<Shared>, name: String, callbacks: DeleteCallbacks) {
    let step = shared.with_state(|state| match state.databases.get(&name) {
        None => DeleteStep::Missing,
        Some(db) if db.upgrading => DeleteStep::Defer,
        Some(db) => DeleteStep::Present(db.version),
    });

    let version = match step {
        DeleteStep::Missing => return (callbacks.on_success)(),
        DeleteStep::Defer => return defer_delete(shared, name, callbacks),
        DeleteStep::Present(version) => version,
    };

    let change = VersionChange {
        old_version: version,
        new_version: None,
    };
    match wait_for_exclusive_access(shared, &name, change) {
        Gate::Wait => defer_delete(shared, name, callbacks),
        Gate::Blocked(open_connections) => {
            warn!(database = %name, open_connections, "delete blocked");
            if let Some(on_blocked) = callbacks.on_blocked {
                on_blocked(change);
            }
            (callbacks.on_error)(EngineError::Blocked {
                database: name,
                open_connections,
            });
        }
        Gate::Proceed => {
            shared.with_state(|state| {
                if let Some(db) = state.databases.remove(&name) {
                    state.graveyard.push(Box::new(db));
                }
                state.requeue_deferred();
            });
            debug!(database = %name, "database deleted");
            (callbacks.on_success)();
        }
    }
}

fn defer_delete(shared: &Arc<Shared>, name: String, callbacks: DeleteCallbacks) {
    let retry = Arc::clone(shared);
    shared.with_state(|state| {
        state
            .deferred
            .push(Box::new(move || run_delete(&retry, name, callbacks)));
    });
}

#[cfg(test)]
mod tests;
