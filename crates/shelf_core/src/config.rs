//! Database configuration.
//!
//! A [`DatabaseConfig`] declares a database: its name, its version and the
//! object stores and indexes it must contain. Configs are built in code or
//! loaded from JSON:
//!
//! ```json
//! {
//!   "name": "MyDb",
//!   "version": 1,
//!   "stores": [
//!     {
//!       "name": "people",
//!       "keyPath": "id",
//!       "autoIncrement": true,
//!       "indexes": [{ "name": "email", "keyPath": "email", "unique": true }]
//!     }
//!   ]
//! }
//! ```
//!
//! Migration steps are code and never come from JSON.

use crate::error::{CoreError, CoreResult};
use crate::migration::{MigrationFactory, MigrationSteps, UpgradePlan};
use serde::{Deserialize, Serialize};
use shelf_engine::{IndexParameters, KeyPath, StoreParameters};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Declaration of one database.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database name, unique within a shelf.
    pub name: String,

    /// Schema version; at least 1.
    pub version: u32,

    /// Object stores, created in this order.
    #[serde(default)]
    pub stores: Vec<StoreSchema>,

    /// Produces the migration steps run during upgrades.
    #[serde(skip)]
    pub migrations: Option<MigrationFactory>,

    /// Whether operations without a database name use this database.
    #[serde(default)]
    pub is_default: bool,
}

impl DatabaseConfig {
    /// Creates a configuration without stores.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            stores: Vec::new(),
            migrations: None,
            is_default: false,
        }
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] for malformed JSON and
    /// [`CoreError::Config`] if the parsed configuration is invalid.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if serialization fails.
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Adds an object store.
    #[must_use]
    pub fn store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    /// Sets the migration factory.
    #[must_use]
    pub fn migrations(
        mut self,
        factory: impl Fn() -> MigrationSteps + Send + Sync + 'static,
    ) -> Self {
        self.migrations = Some(Arc::new(factory));
        self
    }

    /// Marks this database as the default.
    #[must_use]
    pub const fn default_database(mut self, value: bool) -> Self {
        self.is_default = value;
        self
    }

    /// Looks up a declared store.
    #[must_use]
    pub fn store_schema(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// The upgrade plan that brings a database in line with this config.
    #[must_use]
    pub fn upgrade_plan(&self) -> UpgradePlan {
        let plan = UpgradePlan::new(self.stores.clone());
        match &self.migrations {
            Some(factory) => plan.with_factory(Arc::clone(factory)),
            None => plan,
        }
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if:
    /// - The name is empty or the version is 0
    /// - Two stores share a name
    /// - A store or index is invalid (see [`StoreSchema::validate`])
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::config("database name must not be empty"));
        }
        if self.version == 0 {
            return Err(CoreError::config(format!(
                "database {} must have a version of at least 1",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for store in &self.stores {
            if !seen.insert(store.name.as_str()) {
                return Err(CoreError::config(format!(
                    "object store {} is declared twice in database {}",
                    store.name, self.name
                )));
            }
            store.validate()?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("stores", &self.stores)
            .field("migrations", &self.migrations.is_some())
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// Declaration of one object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    /// Store name, unique within the database.
    pub name: String,

    /// Where records keep their key; `None` for out-of-line keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,

    /// Whether the store generates keys.
    #[serde(default)]
    pub auto_increment: bool,

    /// Secondary indexes, created in this order.
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    /// Creates a store with out-of-line keys and no indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// Sets the key path.
    #[must_use]
    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Sets whether keys are generated.
    #[must_use]
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Engine parameters for creating the store.
    #[must_use]
    pub fn parameters(&self) -> StoreParameters {
        StoreParameters {
            key_path: self.key_path.clone(),
            auto_increment: self.auto_increment,
        }
    }

    /// Checks the store declaration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if:
    /// - The name is empty or a key path is malformed
    /// - `auto_increment` is combined with a compound or empty key path
    /// - Two indexes share a name
    /// - A multi-entry index uses a compound key path
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::config("object store name must not be empty"));
        }
        if let Some(path) = &self.key_path {
            path.validate()
                .map_err(|e| CoreError::config(format!("store {}: {e}", self.name)))?;
            if self.auto_increment {
                match path {
                    KeyPath::Compound(_) => {
                        return Err(CoreError::config(format!(
                            "store {} cannot combine auto increment with a compound key path",
                            self.name
                        )))
                    }
                    KeyPath::Single(p) if p.is_empty() => {
                        return Err(CoreError::config(format!(
                            "store {} cannot combine auto increment with an empty key path",
                            self.name
                        )))
                    }
                    KeyPath::Single(_) => {}
                }
            }
        }

        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() {
                return Err(CoreError::config(format!(
                    "store {} has an index without a name",
                    self.name
                )));
            }
            if !seen.insert(index.name.as_str()) {
                return Err(CoreError::config(format!(
                    "index {} is declared twice in store {}",
                    index.name, self.name
                )));
            }
            index
                .key_path
                .validate()
                .map_err(|e| CoreError::config(format!("index {}: {e}", index.name)))?;
            if index.multi_entry && index.key_path.is_compound() {
                return Err(CoreError::config(format!(
                    "multi-entry index {} cannot use a compound key path",
                    index.name
                )));
            }
        }
        Ok(())
    }
}

/// Declaration of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    /// Index name, unique within the store.
    pub name: String,

    /// The indexed field or fields.
    pub key_path: KeyPath,

    /// Whether two records may share an index key.
    #[serde(default)]
    pub unique: bool,

    /// Whether array values index each element separately.
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexSchema {
    /// Creates a non-unique index.
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Sets uniqueness.
    #[must_use]
    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Sets multi-entry indexing.
    #[must_use]
    pub const fn multi_entry(mut self, value: bool) -> Self {
        self.multi_entry = value;
        self
    }

    /// Engine parameters for creating the index.
    #[must_use]
    pub const fn parameters(&self) -> IndexParameters {
        IndexParameters {
            unique: self.unique,
            multi_entry: self.multi_entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> DatabaseConfig {
        DatabaseConfig::new("MyDb", 1).store(
            StoreSchema::new("people")
                .key_path("id")
                .auto_increment(true)
                .index(IndexSchema::new("name", "name"))
                .index(IndexSchema::new("email", "email").unique(true)),
        )
    }

    #[test]
    fn builder_pattern() {
        let config = people().default_database(true);
        assert!(config.is_default);
        assert_eq!(config.stores.len(), 1);
        assert_eq!(
            config.store_schema("people").unwrap().indexes[1],
            IndexSchema::new("email", "email").unique(true)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_json() {
        let config = DatabaseConfig::from_json(
            r#"{
                "name": "MyDb",
                "version": 2,
                "stores": [{
                    "name": "people",
                    "keyPath": "id",
                    "autoIncrement": true,
                    "indexes": [
                        {"name": "email", "keyPath": "email", "unique": true},
                        {"name": "tags", "keyPath": "tags", "multiEntry": true},
                        {"name": "full", "keyPath": ["first", "last"]}
                    ]
                }],
                "isDefault": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.version, 2);
        assert!(config.is_default);
        let store = &config.stores[0];
        assert_eq!(store.key_path, Some(KeyPath::single("id")));
        assert!(store.indexes[1].multi_entry);
        assert_eq!(store.indexes[2].key_path, KeyPath::compound(["first", "last"]));
        assert!(config.migrations.is_none());
    }

    #[test]
    fn json_round_trip_keeps_schema() {
        let config = people();
        let parsed = DatabaseConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed.stores, config.stores);
    }

    #[test]
    fn rejects_zero_version() {
        let err = DatabaseConfig::new("MyDb", 0).validate().unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn rejects_duplicate_stores() {
        let config = DatabaseConfig::new("MyDb", 1)
            .store(StoreSchema::new("a"))
            .store(StoreSchema::new("a"));
        assert!(matches!(config.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn rejects_auto_increment_with_compound_path() {
        let store = StoreSchema::new("pairs")
            .key_path(KeyPath::compound(["a", "b"]))
            .auto_increment(true);
        assert!(matches!(store.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn rejects_compound_multi_entry_index() {
        let store = StoreSchema::new("s").index(
            IndexSchema::new("i", KeyPath::compound(["a", "b"])).multi_entry(true),
        );
        assert!(matches!(store.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn rejects_duplicate_indexes() {
        let store = StoreSchema::new("s")
            .index(IndexSchema::new("i", "a"))
            .index(IndexSchema::new("i", "b"));
        assert!(matches!(store.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn upgrade_plan_carries_migrations() {
        let config = people().migrations(MigrationSteps::new);
        let plan = config.upgrade_plan();
        assert_eq!(plan.stores().len(), 1);
        assert!(plan.has_migrations());
    }
}
