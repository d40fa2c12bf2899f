//! Registry of configured databases.

use crate::config::{DatabaseConfig, StoreSchema};
use crate::error::{CoreError, CoreResult};
use crate::migration::UpgradePlan;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct Entry {
    config: DatabaseConfig,
    version: u32,
}

/// Maps logical database names to their configuration and current version,
/// and tracks which database unnamed operations use.
///
/// Resolution order for unnamed operations: the database chosen with
/// [`Registry::select`], then the one marked default, then the only
/// registered database.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, Entry>,
    selected: Option<String>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if the configuration is invalid, the
    /// name is taken, or a second database is marked default.
    pub fn register(&mut self, config: DatabaseConfig) -> CoreResult<()> {
        config.validate()?;
        if self.entries.contains_key(&config.name) {
            return Err(CoreError::config(format!(
                "database {} is registered twice",
                config.name
            )));
        }
        if config.is_default {
            if let Some(existing) = self.explicit_default() {
                return Err(CoreError::config(format!(
                    "databases {existing} and {} are both marked default",
                    config.name
                )));
            }
        }
        self.entries.insert(
            config.name.clone(),
            Entry {
                version: config.version,
                config,
            },
        );
        Ok(())
    }

    fn explicit_default(&self) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| entry.config.is_default)
            .map(|entry| entry.config.name.as_str())
    }

    /// The database unnamed operations use without a selection.
    #[must_use]
    pub fn default_name(&self) -> Option<&str> {
        self.explicit_default().or_else(|| {
            if self.entries.len() == 1 {
                self.entries.keys().next().map(String::as_str)
            } else {
                None
            }
        })
    }

    /// Makes unnamed operations use `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn select(&mut self, name: &str) -> CoreResult<()> {
        self.entry(name)?;
        self.selected = Some(name.to_string());
        Ok(())
    }

    /// The name an operation on `name` (or on no name) runs against.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names and
    /// [`CoreError::NoDefaultDatabase`] when no name is given and none can
    /// be chosen.
    pub fn resolve(&self, name: Option<&str>) -> CoreResult<String> {
        match name {
            Some(name) => self.entry(name).map(|entry| entry.config.name.clone()),
            None => self
                .selected
                .as_deref()
                .or_else(|| self.default_name())
                .map(str::to_string)
                .ok_or(CoreError::NoDefaultDatabase),
        }
    }

    fn entry(&self, name: &str) -> CoreResult<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| CoreError::DatabaseNotInitialized {
                name: name.to_string(),
            })
    }

    fn entry_mut(&mut self, name: &str) -> CoreResult<&mut Entry> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| CoreError::DatabaseNotInitialized {
                name: name.to_string(),
            })
    }

    /// The configuration of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn config(&self, name: &str) -> CoreResult<&DatabaseConfig> {
        self.entry(name).map(|entry| &entry.config)
    }

    /// The version operations on `name` open at.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn version(&self, name: &str) -> CoreResult<u32> {
        self.entry(name).map(|entry| entry.version)
    }

    /// Records the version `name` is at.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn set_version(&mut self, name: &str, version: u32) -> CoreResult<()> {
        self.entry_mut(name)?.version = version;
        Ok(())
    }

    /// Version and upgrade plan for opening `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn open_args(&self, name: &str) -> CoreResult<(u32, UpgradePlan)> {
        let entry = self.entry(name)?;
        Ok((entry.version, entry.config.upgrade_plan()))
    }

    /// Declares a store created after registration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn add_store(&mut self, name: &str, schema: StoreSchema) -> CoreResult<()> {
        let entry = self.entry_mut(name)?;
        entry.config.stores.retain(|s| s.name != schema.name);
        entry.config.stores.push(schema);
        Ok(())
    }

    /// Forgets a store deleted after registration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotInitialized`] for unknown names.
    pub fn remove_store(&mut self, name: &str, store: &str) -> CoreResult<()> {
        self.entry_mut(name)?
            .config
            .stores
            .retain(|s| s.name != store);
        Ok(())
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of registered databases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(name: &str) -> DatabaseConfig {
        DatabaseConfig::new(name, 1)
    }

    #[test]
    fn lone_database_is_default() {
        let mut registry = Registry::new();
        registry.register(config("MyDb")).unwrap();
        assert_eq!(registry.default_name(), Some("MyDb"));
        assert_eq!(registry.resolve(None).unwrap(), "MyDb");
    }

    #[test]
    fn several_databases_need_a_default() {
        let mut registry = Registry::new();
        registry.register(config("a")).unwrap();
        registry.register(config("b")).unwrap();
        assert!(matches!(
            registry.resolve(None),
            Err(CoreError::NoDefaultDatabase)
        ));
    }

    #[test]
    fn explicit_default_wins() {
        let mut registry = Registry::new();
        registry.register(config("a")).unwrap();
        registry
            .register(config("b").default_database(true))
            .unwrap();
        assert_eq!(registry.resolve(None).unwrap(), "b");
    }

    #[test]
    fn two_defaults_are_rejected() {
        let mut registry = Registry::new();
        registry
            .register(config("a").default_database(true))
            .unwrap();
        let err = registry
            .register(config("b").default_database(true))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry.register(config("a")).unwrap();
        assert!(matches!(
            registry.register(config("a")),
            Err(CoreError::Config { .. })
        ));
    }

    #[test]
    fn selection_overrides_default() {
        let mut registry = Registry::new();
        registry
            .register(config("a").default_database(true))
            .unwrap();
        registry.register(config("b")).unwrap();
        registry.select("b").unwrap();
        assert_eq!(registry.resolve(None).unwrap(), "b");
        assert_eq!(registry.resolve(Some("a")).unwrap(), "a");
    }

    #[test]
    fn unknown_names_are_not_initialized() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.select("nope"),
            Err(CoreError::DatabaseNotInitialized { .. })
        ));
        assert!(matches!(
            registry.resolve(Some("nope")),
            Err(CoreError::DatabaseNotInitialized { name }) if name == "nope"
        ));
    }

    #[test]
    fn tracks_versions_and_stores() {
        let mut registry = Registry::new();
        registry.register(config("a")).unwrap();
        registry.set_version("a", 3).unwrap();
        registry.add_store("a", StoreSchema::new("cars")).unwrap();
        let (version, plan) = registry.open_args("a").unwrap();
        assert_eq!(version, 3);
        assert_eq!(plan.stores().len(), 1);
        registry.remove_store("a", "cars").unwrap();
        assert!(registry.config("a").unwrap().stores.is_empty());
        assert_eq!(registry.names(), vec!["a"]);
        assert_eq!(registry.len(), 1);
    }

    proptest! {
        #[test]
        fn resolution_prefers_selection_then_default(
            names in prop::collection::btree_set("[a-z]{1,8}", 1..6),
            marked in any::<prop::sample::Index>(),
            chosen in any::<prop::sample::Index>(),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let marked = marked.get(&names).clone();
            let chosen = chosen.get(&names).clone();
            let mut registry = Registry::new();
            for name in &names {
                registry
                    .register(config(name).default_database(*name == marked))
                    .unwrap();
            }
            prop_assert_eq!(registry.resolve(None).unwrap(), marked);
            registry.select(&chosen).unwrap();
            prop_assert_eq!(registry.resolve(None).unwrap(), chosen);
        }
    }
}
