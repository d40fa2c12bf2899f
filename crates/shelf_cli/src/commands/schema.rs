//! Schema command implementation.

use super::check_format;
use serde::Serialize;
use shelf_core::{DatabaseConfig, EngineFactory, KeyPath, MemoryEngine, Shelf, StoreSchema};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of applying a configuration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResult {
    /// Database name.
    pub database: String,
    /// Version the database ended at.
    pub version: u32,
    /// Version before the upgrade, if upgrading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<u32>,
    /// Object stores on the upgraded database.
    pub stores: Vec<StoreSchema>,
    /// Object stores the upgrade created.
    pub added_stores: Vec<String>,
    /// Indexes the upgrade created on stores that already existed.
    pub added_indexes: Vec<String>,
}

fn load(path: &Path) -> Result<DatabaseConfig, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read {}: {e}", path.display()))?;
    Ok(DatabaseConfig::from_json(&json)?)
}

fn added_indexes(before: &DatabaseConfig, after: &DatabaseConfig) -> Vec<String> {
    let mut added = Vec::new();
    for store in &after.stores {
        if let Some(old) = before.store_schema(&store.name) {
            for index in &store.indexes {
                if !old.indexes.iter().any(|i| i.name == index.name) {
                    added.push(format!("{}.{}", store.name, index.name));
                }
            }
        }
    }
    added
}

/// Runs the schema command.
pub async fn run(
    config_path: &Path,
    from: Option<&Path>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    check_format(format)?;
    let config = load(config_path)?;
    let name = config.name.clone();
    let engine: Arc<dyn EngineFactory> = Arc::new(MemoryEngine::new()?);

    let mut from_version = None;
    let mut before = Vec::new();
    let mut added_idx = Vec::new();
    if let Some(from) = from {
        let old = load(from)?;
        if old.name != config.name {
            return Err(format!(
                "Configurations describe different databases: {} and {}",
                old.name, config.name
            )
            .into());
        }
        added_idx = added_indexes(&old, &config);
        let shelf = Shelf::builder()
            .shared_engine(Arc::clone(&engine))
            .database(old)
            .build()
            .await?;
        let db = shelf.database(Some(&name))?;
        from_version = Some(db.version().await?);
        before = db.object_store_names().await?;
        info!(database = %name, version = ?from_version, "applied older configuration");
    }

    let shelf = Shelf::builder()
        .shared_engine(engine)
        .database(config)
        .build()
        .await?;
    let db = shelf.database(Some(&name))?;
    let after = db.object_store_names().await?;
    let applied = shelf.config(&name)?;

    let result = SchemaResult {
        database: name,
        version: db.version().await?,
        from_version,
        stores: applied.stores.clone(),
        added_stores: after.into_iter().filter(|s| !before.contains(s)).collect(),
        added_indexes: added_idx,
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_text(&result);
    }

    Ok(())
}

fn describe(path: Option<&KeyPath>) -> String {
    match path {
        None => "(out-of-line)".to_string(),
        Some(KeyPath::Single(p)) if p.is_empty() => "(record)".to_string(),
        Some(KeyPath::Single(p)) => p.clone(),
        Some(KeyPath::Compound(paths)) => format!("[{}]", paths.join(", ")),
    }
}

fn print_text(result: &SchemaResult) {
    println!("Shelf Schema");
    println!("============");
    println!();
    println!("Database: {}", result.database);
    match result.from_version {
        Some(from) => println!("Version:  {} -> {}", from, result.version),
        None => println!("Version:  {}", result.version),
    }
    println!();
    println!("Stores:");
    for store in &result.stores {
        let marker = if result.added_stores.contains(&store.name) && result.from_version.is_some() {
            " (new)"
        } else {
            ""
        };
        println!(
            "  {}{}  key: {}{}",
            store.name,
            marker,
            describe(store.key_path.as_ref()),
            if store.auto_increment { ", auto increment" } else { "" }
        );
        for index in &store.indexes {
            let mut flags = Vec::new();
            if index.unique {
                flags.push("unique");
            }
            if index.multi_entry {
                flags.push("multi-entry");
            }
            println!(
                "    - {} on {}{}",
                index.name,
                describe(Some(&index.key_path)),
                if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                }
            );
        }
    }
    if !result.added_indexes.is_empty() {
        println!();
        println!("Indexes added to existing stores:");
        for index in &result.added_indexes {
            println!("  {}", index);
        }
    }
}
