//! Multi-database entry point.

use crate::config::DatabaseConfig;
use crate::connection::ConnectionOpener;
use crate::database::{open_adopting, Database};
use crate::error::{CoreError, CoreResult};
use crate::registry::Registry;
use parking_lot::RwLock;
use shelf_engine::{DatabaseInfo, EngineFactory, UnavailableEngine};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builder for [`Shelf`].
#[derive(Default)]
pub struct ShelfBuilder {
    engine: Option<Arc<dyn EngineFactory>>,
    databases: Vec<DatabaseConfig>,
}

impl ShelfBuilder {
    /// Uses `engine` for storage.
    ///
    /// Without an engine every operation fails with
    /// [`CoreError::NotAvailable`].
    #[must_use]
    pub fn engine(self, engine: impl EngineFactory + 'static) -> Self {
        self.shared_engine(Arc::new(engine))
    }

    /// Uses an engine shared with other owners.
    #[must_use]
    pub fn shared_engine(mut self, engine: Arc<dyn EngineFactory>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Declares a database.
    #[must_use]
    pub fn database(mut self, config: DatabaseConfig) -> Self {
        self.databases.push(config);
        self
    }

    /// Registers the declared databases and brings each one to its
    /// configured version.
    ///
    /// If the engine has no storage, initialization is skipped and the
    /// shelf is still returned; its operations then fail with
    /// [`CoreError::NotAvailable`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for invalid or conflicting
    /// configurations and [`CoreError::Connection`] if a database cannot be
    /// opened or migrated.
    pub async fn build(self) -> CoreResult<Shelf> {
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(UnavailableEngine::new()));
        let mut registry = Registry::new();
        for config in self.databases {
            registry.register(config)?;
        }
        let names: Vec<String> = registry.names().into_iter().map(str::to_string).collect();
        let shelf = Shelf {
            opener: ConnectionOpener::new(engine),
            registry: Arc::new(RwLock::new(registry)),
        };

        for name in &names {
            match open_adopting(&shelf.opener, &shelf.registry, name).await {
                Ok(conn) => {
                    info!(
                        database = %name,
                        version = conn.version(),
                        stores = conn.object_store_names().len(),
                        "database initialized"
                    );
                }
                Err(CoreError::NotAvailable(reason)) => {
                    warn!(database = %name, %reason, "storage not available, skipping initialization");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(shelf)
    }
}

impl fmt::Debug for ShelfBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShelfBuilder")
            .field("has_engine", &self.engine.is_some())
            .field("databases", &self.databases)
            .finish()
    }
}

/// A set of named databases on one engine.
///
/// Operations given no database name run against the selected database,
/// else the one marked default, else the only one declared.
#[derive(Clone)]
pub struct Shelf {
    opener: ConnectionOpener,
    registry: Arc<RwLock<Registry>>,
}

impl Shelf {
    /// Starts building a shelf.
    #[must_use]
    pub fn builder() -> ShelfBuilder {
        ShelfBuilder::default()
    }

    /// The façade of a database, or of the current one when `name` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for undeclared names
    /// and [`CoreError::NoDefaultDatabase`] when no name is given and none
    /// can be chosen.
    pub fn database(&self, name: Option<&str>) -> CoreResult<Database> {
        let name = self.registry.read().resolve(name)?;
        Ok(Database::new(
            &name,
            self.opener.clone(),
            Arc::clone(&self.registry),
        ))
    }

    /// Makes unnamed operations use `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for undeclared names.
    pub fn select_db(&self, name: &str) -> CoreResult<()> {
        self.registry.write().select(name)?;
        debug!(database = name, "database selected");
        Ok(())
    }

    /// The name unnamed operations currently use.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoDefaultDatabase`] when none can be chosen.
    pub fn current(&self) -> CoreResult<String> {
        self.registry.read().resolve(None)
    }

    /// Declared database names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.registry
            .read()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// The configuration a database was declared with, including stores
    /// created since.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for undeclared names.
    pub fn config(&self, name: &str) -> CoreResult<DatabaseConfig> {
        self.registry.read().config(name).cloned()
    }

    /// Lists the databases the engine stores, declared or not.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the engine fails to list them.
    pub async fn databases(&self) -> CoreResult<Vec<DatabaseInfo>> {
        self.opener.databases().await
    }

    /// Deletes a declared database.
    ///
    /// The declaration stays, so the next operation on it recreates the
    /// database from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for undeclared names
    /// and [`CoreError::DeleteBlocked`] if another connection stays open.
    pub async fn delete_database(&self, name: &str) -> CoreResult<()> {
        self.database(Some(name))?.delete_database().await
    }
}

impl fmt::Debug for Shelf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shelf")
            .field("databases", &self.names())
            .finish_non_exhaustive()
    }
}
