//! Connection opening and release.

use crate::error::{CoreError, CoreResult};
use crate::migration::{SchemaMigrator, UpgradePlan};
use crate::transaction::{enter, Phase, Settle};
use shelf_engine::{
    DatabaseInfo, DeleteCallbacks, EngineConnection, EngineError, EngineFactory, OpenCallbacks,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// An open connection to one database.
///
/// The connection closes when dropped, whether the operation holding it
/// succeeded, failed or was cancelled. It also closes itself when another
/// party upgrades or deletes the database.
pub struct Connection {
    inner: Arc<dyn EngineConnection>,
    _engine: Arc<dyn EngineFactory>,
}

impl Connection {
    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The version the database was opened at.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.version()
    }

    /// Names of the object stores, sorted.
    #[must_use]
    pub fn object_store_names(&self) -> Vec<String> {
        self.inner.object_store_names()
    }

    /// Returns true if the database has the store.
    #[must_use]
    pub fn has_store(&self, name: &str) -> bool {
        self.object_store_names().iter().any(|store| store == name)
    }

    /// The engine connection.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn EngineConnection> {
        &self.inner
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

fn close_on_version_change(conn: &Arc<dyn EngineConnection>) {
    let weak = Arc::downgrade(conn);
    let name = conn.name().to_string();
    conn.set_on_version_change(Box::new(move |change| {
        debug!(
            database = %name,
            old_version = change.old_version,
            new_version = ?change.new_version,
            "version change requested elsewhere, closing connection"
        );
        if let Some(conn) = weak.upgrade() {
            conn.close();
        }
    }));
}

/// Opens and deletes databases on an engine.
#[derive(Clone)]
pub struct ConnectionOpener {
    engine: Arc<dyn EngineFactory>,
}

impl ConnectionOpener {
    /// Creates an opener for `engine`.
    pub fn new(engine: Arc<dyn EngineFactory>) -> Self {
        Self { engine }
    }

    /// Opens `name`.
    ///
    /// With `version` omitted the database opens at its current version.
    /// A higher version upgrades the database; the upgrade runs `plan`
    /// through the [`SchemaMigrator`] and fails the open if the plan fails.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - [`CoreError::NotAvailable`] if the engine has no storage
    /// - [`CoreError::Connection`] for every other failure: a version lower
    ///   than the stored one, a failed upgrade, connections blocking the
    ///   upgrade
    pub async fn open(
        &self,
        name: &str,
        version: Option<u32>,
        plan: Option<&UpgradePlan>,
    ) -> CoreResult<Connection> {
        enter(name, Phase::ConnectionOpening);
        let (settle, rx) = Settle::<Result<Arc<dyn EngineConnection>, EngineError>>::channel();
        let on_error = settle.clone();

        let mut callbacks = OpenCallbacks::new(
            move |conn| {
                close_on_version_change(&conn);
                if let Err(Ok(conn)) = settle.send(Ok(conn)) {
                    conn.close();
                }
            },
            move |err| {
                let _ = on_error.send(Err(err));
            },
        )
        .on_blocked({
            let database = name.to_string();
            move |change| {
                warn!(
                    database = %database,
                    new_version = ?change.new_version,
                    "open blocked by connections that stayed open"
                );
            }
        });

        if let Some(plan) = plan {
            let plan = plan.clone();
            let database = name.to_string();
            callbacks = callbacks.on_upgrade_needed(move |upgrade| {
                enter(&database, Phase::Migrating);
                SchemaMigrator::apply(upgrade, &plan)
                    .map(|_| ())
                    .map_err(|err| {
                        warn!(database = %database, error = %err, "upgrade failed");
                        err.into_engine()
                    })
            });
        }

        self.engine.open(name, version, callbacks);
        match rx.await {
            Ok(Ok(inner)) => {
                debug!(database = name, version = inner.version(), "connection opened");
                Ok(Connection {
                    inner,
                    _engine: Arc::clone(&self.engine),
                })
            }
            Ok(Err(err)) => Err(CoreError::from_open(name, err)),
            Err(_) => Err(CoreError::connection(name, EngineError::Closed)),
        }
    }

    /// Deletes `name`. Deleting a missing database succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DeleteBlocked`] if another connection stays
    /// open, [`CoreError::NotAvailable`] if the engine has no storage and
    /// [`CoreError::Connection`] otherwise.
    pub async fn delete_database(&self, name: &str) -> CoreResult<()> {
        let (settle, rx) = Settle::<Result<(), EngineError>>::channel();
        let on_error = settle.clone();
        let callbacks = DeleteCallbacks::new(
            move || {
                let _ = settle.send(Ok(()));
            },
            move |err| {
                let _ = on_error.send(Err(err));
            },
        )
        .on_blocked({
            let database = name.to_string();
            move |_| warn!(database = %database, "delete blocked by open connections")
        });

        self.engine.delete_database(name, callbacks);
        match rx.await {
            Ok(Ok(())) => {
                debug!(database = name, "database deleted");
                Ok(())
            }
            Ok(Err(err)) => Err(CoreError::from_delete(name, err)),
            Err(_) => Err(CoreError::connection(name, EngineError::Closed)),
        }
    }

    /// Lists the stored databases.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the engine fails to list them.
    pub async fn databases(&self) -> CoreResult<Vec<DatabaseInfo>> {
        let (settle, rx) = Settle::channel();
        self.engine.databases(Box::new(move |list| {
            let _ = settle.send(list);
        }));
        rx.await
            .unwrap_or(Err(EngineError::Closed))
            .map_err(CoreError::Transaction)
    }
}

impl fmt::Debug for ConnectionOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOpener").finish_non_exhaustive()
    }
}
