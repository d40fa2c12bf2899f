//! CLI command implementations.

pub mod demo;
pub mod schema;

/// Returns an error for output formats other than `text` and `json`.
pub fn check_format(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "text" | "json" => Ok(()),
        other => Err(format!("Unknown output format: {other} (expected text or json)").into()),
    }
}
