//! Transaction coordination.
//!
//! The engine reports through callbacks fired on its event loop. This
//! module turns one engine transaction into one future (or one stream):
//!
//! 1. Store names are checked against the connection before the engine is
//!    touched
//! 2. The body runs on the event loop, inside the task that created the
//!    transaction, so its requests are issued while the transaction is
//!    active
//! 3. Complete, error and abort callbacks all feed one settle path; the
//!    caller sees exactly one outcome
//!
//! ```text
//! Idle -> ConnectionOpening -> (Migrating) -> TransactionOpen -> RequestPending
//!      -> Committed -> ResultEmitted
//!      -> Aborted   -> ErrorEmitted
//! ```

use crate::connection::Connection;
use crate::error::{CoreError, CoreResult};
use futures::channel::{mpsc, oneshot};
use futures::Stream;
use parking_lot::Mutex;
use shelf_engine::{
    CursorDirection, EngineCursor, EngineError, EngineTransaction, KeyRange, RequestOutput,
    RequestTarget, StoreRequest, TransactionCallbacks, TransactionMode,
};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::trace;

/// States an operation moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing started yet.
    Idle,
    /// Waiting for the engine to open the connection.
    ConnectionOpening,
    /// Running the schema migrator inside an upgrade.
    Migrating,
    /// The transaction exists and the body is issuing requests.
    TransactionOpen,
    /// At least one request is in flight.
    RequestPending,
    /// The transaction committed.
    Committed,
    /// The transaction aborted.
    Aborted,
    /// The result reached the caller.
    ResultEmitted,
    /// The error reached the caller.
    ErrorEmitted,
}

impl Phase {
    /// Returns true for the two states that end an operation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Phase::ResultEmitted | Phase::ErrorEmitted)
    }
}

pub(crate) fn enter(database: &str, phase: Phase) {
    trace!(database, ?phase, "operation phase");
}

/// One-shot sender that can be shared by several callbacks; the first
/// value wins.
pub(crate) struct Settle<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Settle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T> Settle<T> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Delivers `value`, or hands it back if a value was already delivered
    /// or nobody is listening.
    pub(crate) fn send(&self, value: T) -> Result<(), T> {
        let sender = self.sender.lock().take();
        match sender {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }
}

/// The result slot of a transaction, filled by the body or its request
/// callbacks and read once the transaction commits.
pub struct Outcome<R> {
    slot: Arc<Mutex<Option<R>>>,
}

impl<R> Clone for Outcome<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<R> Outcome<R> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Stores the result, replacing an earlier one.
    pub fn set(&self, value: R) {
        *self.slot.lock() = Some(value);
    }

    fn take(&self) -> Option<R> {
        self.slot.lock().take()
    }
}

/// Handle given to transaction bodies.
///
/// Cloneable so request callbacks can issue follow-up requests; all clones
/// refer to the same engine transaction.
#[derive(Clone)]
pub struct TransactionScope {
    database: Arc<str>,
    transaction: Arc<dyn EngineTransaction>,
    failure: Arc<Mutex<Option<CoreError>>>,
}

impl TransactionScope {
    /// The database the transaction runs on.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The transaction mode.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        self.transaction.mode()
    }

    /// The underlying engine transaction.
    #[must_use]
    pub fn transaction(&self) -> &Arc<dyn EngineTransaction> {
        &self.transaction
    }

    /// Issues a request; `on_success` runs with its output.
    ///
    /// A failed request aborts the transaction. An error returned by
    /// `on_success` aborts it as well and becomes the operation's error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the engine rejects the request
    /// outright (inactive transaction, store out of scope, write in a
    /// read-only transaction).
    pub fn request(
        &self,
        target: RequestTarget,
        request: StoreRequest,
        on_success: impl FnOnce(RequestOutput) -> CoreResult<()> + Send + 'static,
    ) -> CoreResult<()> {
        enter(&self.database, Phase::RequestPending);
        let scope = self.clone();
        self.transaction
            .request(
                target,
                request,
                Box::new(move |result| {
                    if let Ok(output) = result {
                        if let Err(err) = on_success(output) {
                            scope.fail(err);
                        }
                    }
                }),
            )
            .map_err(CoreError::Transaction)
    }

    /// Opens a cursor; `on_step` runs for each position and once with
    /// `None` at the end.
    ///
    /// `on_step` must call [`EngineCursor::continue_`] to receive the next
    /// position. An error returned by it aborts the transaction.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionScope::request`].
    pub fn open_cursor(
        &self,
        target: RequestTarget,
        range: Option<KeyRange>,
        direction: CursorDirection,
        key_only: bool,
        mut on_step: impl FnMut(Option<&dyn EngineCursor>) -> CoreResult<()> + Send + 'static,
    ) -> CoreResult<()> {
        enter(&self.database, Phase::RequestPending);
        let scope = self.clone();
        self.transaction
            .open_cursor(
                target,
                range,
                direction,
                key_only,
                Box::new(move |step| {
                    if let Ok(cursor) = step {
                        if let Err(err) = on_step(cursor) {
                            scope.fail(err);
                        }
                    }
                }),
            )
            .map_err(CoreError::Transaction)
    }

    /// Signals that no more requests follow; the transaction commits once
    /// the pending ones finish.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the transaction already
    /// finished.
    pub fn commit(&self) -> CoreResult<()> {
        self.transaction.commit().map_err(CoreError::Transaction)
    }

    /// Aborts the transaction and reports `err` as the operation's error.
    pub fn fail(&self, err: CoreError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        if let Err(err) = self.transaction.abort() {
            trace!(database = %self.database, error = %err, "abort skipped, transaction already finished");
        }
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("database", &self.database)
            .field("mode", &self.transaction.mode())
            .field("scope", &self.transaction.scope())
            .finish()
    }
}

fn check_stores(conn: &Connection, stores: &[&str]) -> CoreResult<Vec<String>> {
    let names = conn.object_store_names();
    stores
        .iter()
        .map(|store| {
            if names.iter().any(|name| name == store) {
                Ok((*store).to_string())
            } else {
                Err(CoreError::store_not_found(conn.name(), *store))
            }
        })
        .collect()
}

fn abort_cause(failure: &Mutex<Option<CoreError>>, err: EngineError) -> CoreError {
    failure
        .lock()
        .take()
        .unwrap_or(CoreError::Transaction(err))
}

/// Runs `body` in a new transaction and resolves with the value it stores
/// in the [`Outcome`] once the transaction commits.
///
/// # Errors
///
/// Returns:
/// - [`CoreError::StoreNotFound`] before touching the engine if a store is
///   missing
/// - [`CoreError::Transaction`] if the transaction cannot start, a request
///   fails or the transaction aborts, or it commits without a result
/// - The body's own error if the body or one of its callbacks fails
pub async fn with_transaction<R, F>(
    conn: &Connection,
    stores: &[&str],
    mode: TransactionMode,
    body: F,
) -> CoreResult<R>
where
    R: Send + 'static,
    F: FnOnce(&TransactionScope, &Outcome<R>) -> CoreResult<()> + Send + 'static,
{
    let scope_names = check_stores(conn, stores)?;
    let database: Arc<str> = Arc::from(conn.name());
    let engine = Arc::clone(conn.engine());
    let (settle, rx) = Settle::<CoreResult<R>>::channel();

    let loop_database = Arc::clone(&database);
    conn.engine().dispatch(Box::new(move || {
        let database = loop_database;
        enter(&database, Phase::TransactionOpen);
        let outcome = Outcome::new();
        let failure = Arc::new(Mutex::new(None));

        let on_complete = {
            let settle = settle.clone();
            let outcome = outcome.clone();
            let failure = Arc::clone(&failure);
            let database = Arc::clone(&database);
            move || {
                enter(&database, Phase::Committed);
                let result = match failure.lock().take() {
                    Some(err) => Err(err),
                    None => outcome.take().ok_or_else(|| {
                        CoreError::Transaction(EngineError::invalid_state(
                            "transaction committed without a result",
                        ))
                    }),
                };
                let _ = settle.send(result);
            }
        };
        let on_abort = {
            let settle = settle.clone();
            let failure = Arc::clone(&failure);
            let database = Arc::clone(&database);
            move |err| {
                enter(&database, Phase::Aborted);
                let _ = settle.send(Err(abort_cause(&failure, err)));
            }
        };
        let callbacks = TransactionCallbacks::new(on_complete, on_abort).on_error({
            let database = Arc::clone(&database);
            move |err| trace!(database = %database, error = %err, "request failed")
        });

        match engine.transaction(&scope_names, mode, callbacks) {
            Ok(transaction) => {
                let scope = TransactionScope {
                    database,
                    transaction,
                    failure,
                };
                if let Err(err) = body(&scope, &outcome) {
                    scope.fail(err);
                }
            }
            Err(err) => {
                let _ = settle.send(Err(CoreError::Transaction(err)));
            }
        }
    }));

    let result = rx
        .await
        .unwrap_or(Err(CoreError::Transaction(EngineError::Closed)));
    enter(
        &database,
        if result.is_ok() {
            Phase::ResultEmitted
        } else {
            Phase::ErrorEmitted
        },
    );
    result
}

/// Pushes items into a [`TransactionStream`].
pub struct Emitter<T> {
    sender: mpsc::UnboundedSender<CoreResult<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> Emitter<T> {
    /// Sends an item. Returns false once the consumer has gone away.
    pub fn emit(&self, item: T) -> bool {
        self.sender.unbounded_send(Ok(item)).is_ok()
    }

    /// Returns true once the consumer has gone away or the stream ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn fail(&self, err: CoreError) {
        let _ = self.sender.unbounded_send(Err(err));
        self.sender.close_channel();
    }

    fn close(&self) {
        self.sender.close_channel();
    }
}

/// Items emitted by a streaming transaction.
///
/// Ends after the transaction commits; an abort yields one error, then
/// ends. Holds the connection open until dropped.
#[must_use = "streams do nothing unless polled"]
pub struct TransactionStream<T> {
    receiver: mpsc::UnboundedReceiver<CoreResult<T>>,
    _connection: Connection,
}

impl<T> Stream for TransactionStream<T> {
    type Item = CoreResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_next(cx)
    }
}

impl<T> fmt::Debug for TransactionStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStream")
            .field("connection", &self._connection)
            .finish()
    }
}

/// Runs `body` in a new transaction and returns the stream of items it
/// emits.
///
/// The transaction starts right away; items are buffered until polled.
///
/// # Errors
///
/// Returns [`CoreError::StoreNotFound`] if a store is missing. Later
/// failures arrive as the stream's last item.
pub fn stream_transaction<T, F>(
    conn: Connection,
    stores: &[&str],
    mode: TransactionMode,
    body: F,
) -> CoreResult<TransactionStream<T>>
where
    T: Send + 'static,
    F: FnOnce(&TransactionScope, &Emitter<T>) -> CoreResult<()> + Send + 'static,
{
    let scope_names = check_stores(&conn, stores)?;
    let database: Arc<str> = Arc::from(conn.name());
    let engine = Arc::clone(conn.engine());
    let (sender, receiver) = mpsc::unbounded();
    let emitter = Emitter { sender };

    conn.engine().dispatch(Box::new(move || {
        enter(&database, Phase::TransactionOpen);
        let failure = Arc::new(Mutex::new(None));
        let on_complete = {
            let emitter = emitter.clone();
            let database = Arc::clone(&database);
            move || {
                enter(&database, Phase::Committed);
                emitter.close();
            }
        };
        let on_abort = {
            let emitter = emitter.clone();
            let failure = Arc::clone(&failure);
            let database = Arc::clone(&database);
            move |err| {
                enter(&database, Phase::Aborted);
                emitter.fail(abort_cause(&failure, err));
            }
        };

        match engine.transaction(
            &scope_names,
            mode,
            TransactionCallbacks::new(on_complete, on_abort),
        ) {
            Ok(transaction) => {
                let scope = TransactionScope {
                    database,
                    transaction,
                    failure,
                };
                if let Err(err) = body(&scope, &emitter) {
                    scope.fail(err);
                }
            }
            Err(err) => emitter.fail(CoreError::Transaction(err)),
        }
    }));

    Ok(TransactionStream {
        receiver,
        _connection: conn,
    })
}
