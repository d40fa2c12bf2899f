//! Schema reconciliation and migration steps.
//!
//! Upgrades happen inside the engine's version change transaction. The
//! [`SchemaMigrator`] first makes the structure match the declared stores,
//! then runs user migration steps.
//!
//! ## Design Philosophy
//!
//! Migrations in Shelf are:
//! - **Additive**: missing stores and indexes are created, nothing is
//!   dropped or altered unless a plan says so explicitly
//! - **Idempotent**: running the same schema twice changes nothing
//! - **Ordered**: steps run in ascending version order, and only steps
//!   newer than the version on disk
//! - **Transactional**: the whole upgrade is one transaction; any error
//!   leaves the database at its previous version and structure
//!
//! ## Usage
//!
//! ```rust
//! use shelf_core::{DatabaseConfig, MigrationSteps, StoreSchema};
//! use serde_json::json;
//!
//! let config = DatabaseConfig::new("MyDb", 2)
//!     .store(StoreSchema::new("people").key_path("id").auto_increment(true))
//!     .migrations(|| {
//!         MigrationSteps::new().step(2, |ctx| {
//!             ctx.put("people", &json!({ "name": "seed" }))?;
//!             Ok(())
//!         })
//!     });
//! assert!(config.upgrade_plan().has_migrations());
//! ```

use crate::config::{IndexSchema, StoreSchema};
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use shelf_engine::{
    EngineConnection, EngineTransaction, RequestTarget, StoreRequest, UpgradeContext,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info};

/// A migration step, run once when upgrading past its version.
pub type MigrationStep = Arc<dyn Fn(&MigrationContext<'_>) -> CoreResult<()> + Send + Sync>;

/// Produces the migration steps of a database.
pub type MigrationFactory = Arc<dyn Fn() -> MigrationSteps + Send + Sync>;

/// Migration steps keyed by the version they upgrade to.
#[derive(Clone, Default)]
pub struct MigrationSteps {
    steps: BTreeMap<u32, MigrationStep>,
}

impl MigrationSteps {
    /// Creates an empty set of steps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the step for `version`, replacing any earlier one.
    #[must_use]
    pub fn step(
        mut self,
        version: u32,
        step: impl Fn(&MigrationContext<'_>) -> CoreResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.steps.insert(version, Arc::new(step));
        self
    }

    /// Versions that have a step, ascending.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.steps.keys().copied().collect()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps newer than `old_version`, ascending.
    fn pending(&self, old_version: u32) -> impl Iterator<Item = (u32, &MigrationStep)> {
        self.steps
            .range((Bound::Excluded(old_version), Bound::Unbounded))
            .map(|(version, step)| (*version, step))
    }
}

impl fmt::Debug for MigrationSteps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSteps")
            .field("versions", &self.versions())
            .finish()
    }
}

/// A structural change made during an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOperation {
    /// Created an object store.
    CreateStore {
        /// Name of the store.
        name: String,
    },
    /// Deleted an object store.
    DeleteStore {
        /// Name of the store.
        name: String,
    },
    /// Created an index.
    CreateIndex {
        /// Store the index is on.
        store: String,
        /// Name of the index.
        index: String,
    },
    /// Deleted an index.
    DeleteIndex {
        /// Store the index was on.
        store: String,
        /// Name of the index.
        index: String,
    },
    /// Custom operation recorded by a step.
    Custom {
        /// Description of the operation.
        description: String,
    },
}

/// What an upgrade did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// The version before the upgrade; 0 for a new database.
    pub old_version: u32,
    /// The version after the upgrade.
    pub new_version: u32,
    /// Structural changes, in the order they happened.
    pub operations: Vec<MigrationOperation>,
    /// Versions of the steps that ran, ascending.
    pub applied_steps: Vec<u32>,
}

impl MigrationReport {
    /// Names of the stores created.
    #[must_use]
    pub fn created_stores(&self) -> Vec<&str> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                MigrationOperation::CreateStore { name } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// `(store, index)` pairs of the indexes created.
    #[must_use]
    pub fn created_indexes(&self) -> Vec<(&str, &str)> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                MigrationOperation::CreateIndex { store, index } => {
                    Some((store.as_str(), index.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.applied_steps.is_empty()
    }
}

/// Everything an upgrade should do.
#[derive(Clone, Default)]
pub struct UpgradePlan {
    stores: Vec<StoreSchema>,
    migrations: Option<MigrationFactory>,
    drop_stores: Vec<String>,
}

impl UpgradePlan {
    /// Creates a plan that brings the structure in line with `stores`.
    #[must_use]
    pub fn new(stores: Vec<StoreSchema>) -> Self {
        Self {
            stores,
            migrations: None,
            drop_stores: Vec::new(),
        }
    }

    /// Sets the migration steps.
    #[must_use]
    pub fn migrations(self, factory: impl Fn() -> MigrationSteps + Send + Sync + 'static) -> Self {
        self.with_factory(Arc::new(factory))
    }

    /// Sets a shared migration factory.
    #[must_use]
    pub fn with_factory(mut self, factory: MigrationFactory) -> Self {
        self.migrations = Some(factory);
        self
    }

    /// Deletes a store before the structure is reconciled.
    #[must_use]
    pub fn drop_store(mut self, name: impl Into<String>) -> Self {
        self.drop_stores.push(name.into());
        self
    }

    /// The declared stores.
    #[must_use]
    pub fn stores(&self) -> &[StoreSchema] {
        &self.stores
    }

    /// Returns true if the plan carries migration steps.
    #[must_use]
    pub fn has_migrations(&self) -> bool {
        self.migrations.is_some()
    }
}

impl fmt::Debug for UpgradePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradePlan")
            .field("stores", &self.stores)
            .field("migrations", &self.migrations.is_some())
            .field("drop_stores", &self.drop_stores)
            .finish()
    }
}

/// Context passed to migration steps.
///
/// Gives access to the connection being upgraded and to the upgrade
/// transaction. Schema edits made through the context are recorded in the
/// [`MigrationReport`].
pub struct MigrationContext<'a> {
    upgrade: &'a dyn UpgradeContext,
    version: u32,
    operations: RefCell<Vec<MigrationOperation>>,
}

impl<'a> MigrationContext<'a> {
    fn new(upgrade: &'a dyn UpgradeContext, version: u32) -> Self {
        Self {
            upgrade,
            version,
            operations: RefCell::new(Vec::new()),
        }
    }

    /// The version of the running step.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The version on disk before the upgrade.
    #[must_use]
    pub fn old_version(&self) -> u32 {
        self.upgrade.old_version()
    }

    /// The version being upgraded to.
    #[must_use]
    pub fn new_version(&self) -> u32 {
        self.upgrade.new_version()
    }

    /// The connection being upgraded.
    #[must_use]
    pub fn connection(&self) -> Arc<dyn EngineConnection> {
        self.upgrade.connection()
    }

    /// The upgrade transaction.
    #[must_use]
    pub fn transaction(&self) -> Arc<dyn EngineTransaction> {
        self.upgrade.transaction()
    }

    /// Names of the stores, sorted.
    #[must_use]
    pub fn object_store_names(&self) -> Vec<String> {
        self.upgrade.object_store_names()
    }

    /// Creates a store with its indexes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the store exists or the
    /// schema is rejected by the engine.
    pub fn create_store(&self, schema: &StoreSchema) -> CoreResult<()> {
        let mut operations = self.operations.borrow_mut();
        create_store(self.upgrade, schema, &mut operations)?;
        for index in &schema.indexes {
            create_index(self.upgrade, &schema.name, index, &mut operations)?;
        }
        Ok(())
    }

    /// Deletes a store and its records.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the store does not exist.
    pub fn delete_store(&self, name: &str) -> CoreResult<()> {
        delete_store(self.upgrade, name, &mut self.operations.borrow_mut())
    }

    /// Creates an index on an existing store.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the index exists or existing
    /// records violate it.
    pub fn create_index(&self, store: &str, index: &IndexSchema) -> CoreResult<()> {
        create_index(self.upgrade, store, index, &mut self.operations.borrow_mut())
    }

    /// Deletes an index.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transaction`] if the store or index does not
    /// exist.
    pub fn delete_index(&self, store: &str, index: &str) -> CoreResult<()> {
        self.upgrade
            .delete_index(store, index)
            .map_err(CoreError::Transaction)?;
        self.operations
            .borrow_mut()
            .push(MigrationOperation::DeleteIndex {
                store: store.to_string(),
                index: index.to_string(),
            });
        Ok(())
    }

    /// Writes a record in the upgrade transaction.
    ///
    /// The write completes after the step returns; if it fails the whole
    /// upgrade aborts.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the record cannot be
    /// converted and [`CoreError::Transaction`] if the request is
    /// rejected.
    pub fn put<T: Serialize>(&self, store: &str, record: &T) -> CoreResult<()> {
        let value = serde_json::to_value(record)?;
        self.upgrade
            .transaction()
            .request(
                RequestTarget::store(store),
                StoreRequest::Put { value, key: None },
                Box::new(|_| {}),
            )
            .map_err(CoreError::Transaction)
    }

    /// Records a custom operation in the report.
    pub fn custom(&self, description: impl Into<String>) {
        self.operations
            .borrow_mut()
            .push(MigrationOperation::Custom {
                description: description.into(),
            });
    }

    fn into_operations(self) -> Vec<MigrationOperation> {
        self.operations.into_inner()
    }
}

fn create_store(
    upgrade: &dyn UpgradeContext,
    schema: &StoreSchema,
    operations: &mut Vec<MigrationOperation>,
) -> CoreResult<()> {
    upgrade
        .create_object_store(&schema.name, &schema.parameters())
        .map_err(CoreError::Transaction)?;
    operations.push(MigrationOperation::CreateStore {
        name: schema.name.clone(),
    });
    Ok(())
}

fn delete_store(
    upgrade: &dyn UpgradeContext,
    name: &str,
    operations: &mut Vec<MigrationOperation>,
) -> CoreResult<()> {
    upgrade
        .delete_object_store(name)
        .map_err(CoreError::Transaction)?;
    operations.push(MigrationOperation::DeleteStore {
        name: name.to_string(),
    });
    Ok(())
}

fn create_index(
    upgrade: &dyn UpgradeContext,
    store: &str,
    index: &IndexSchema,
    operations: &mut Vec<MigrationOperation>,
) -> CoreResult<()> {
    upgrade
        .create_index(store, &index.name, &index.key_path, &index.parameters())
        .map_err(CoreError::Transaction)?;
    operations.push(MigrationOperation::CreateIndex {
        store: store.to_string(),
        index: index.name.clone(),
    });
    Ok(())
}

/// Reconciles the structure of a database during an upgrade.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaMigrator;

impl SchemaMigrator {
    /// Creates missing stores and indexes, then runs the migration steps
    /// newer than `old_version` in ascending order.
    ///
    /// Existing stores and indexes are never dropped or altered.
    ///
    /// # Errors
    ///
    /// Returns the first error of a schema edit or step. Steps that fail
    /// with anything other than [`CoreError::Migration`] are wrapped into
    /// one carrying the step's version.
    pub fn migrate(
        upgrade: &dyn UpgradeContext,
        desired: &[StoreSchema],
        migrations: Option<&MigrationFactory>,
        old_version: u32,
    ) -> CoreResult<MigrationReport> {
        let mut report = MigrationReport {
            old_version,
            new_version: upgrade.new_version(),
            ..MigrationReport::default()
        };

        let existing = upgrade.object_store_names();
        for schema in desired {
            if existing.contains(&schema.name) {
                let indexes = upgrade
                    .index_names(&schema.name)
                    .map_err(CoreError::Transaction)?;
                for index in &schema.indexes {
                    if !indexes.contains(&index.name) {
                        create_index(upgrade, &schema.name, index, &mut report.operations)?;
                    }
                }
            } else {
                create_store(upgrade, schema, &mut report.operations)?;
                for index in &schema.indexes {
                    create_index(upgrade, &schema.name, index, &mut report.operations)?;
                }
            }
        }

        if let Some(factory) = migrations {
            let steps = factory();
            for (version, step) in steps.pending(old_version) {
                debug!(version, "running migration step");
                let context = MigrationContext::new(upgrade, version);
                step(&context).map_err(|err| match err {
                    CoreError::Migration { .. } => err,
                    other => CoreError::migration(version, other.to_string()),
                })?;
                report.operations.extend(context.into_operations());
                report.applied_steps.push(version);
            }
        }

        if !report.is_empty() {
            info!(
                old_version = report.old_version,
                new_version = report.new_version,
                stores = ?report.created_stores(),
                indexes = report.created_indexes().len(),
                steps = ?report.applied_steps,
                "schema migrated"
            );
        }
        Ok(report)
    }

    /// Runs a whole plan: drops the stores it names, then migrates.
    ///
    /// # Errors
    ///
    /// Same as [`SchemaMigrator::migrate`], and for stores to drop that do
    /// not exist.
    pub fn apply(upgrade: &dyn UpgradeContext, plan: &UpgradePlan) -> CoreResult<MigrationReport> {
        let mut dropped = Vec::new();
        for name in &plan.drop_stores {
            delete_store(upgrade, name, &mut dropped)?;
        }
        let mut report = Self::migrate(
            upgrade,
            &plan.stores,
            plan.migrations.as_ref(),
            upgrade.old_version(),
        )?;
        dropped.append(&mut report.operations);
        report.operations = dropped;
        Ok(report)
    }
}
