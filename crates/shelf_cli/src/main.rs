//! Shelf CLI
//!
//! Command-line tools for Shelf schemas.
//!
//! # Commands
//!
//! - `schema` - Validate a database configuration and show the schema it
//!   produces, or what it adds on top of an older configuration
//! - `demo` - Run a small workload on the in-memory engine

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Shelf command-line schema tools.
#[derive(Parser)]
#[command(name = "shelf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a database configuration and apply it to a scratch engine
    Schema {
        /// Path to the configuration (JSON)
        config: PathBuf,

        /// Older configuration to upgrade from
        #[arg(long)]
        from: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Add, count and clear people on the in-memory engine
    Demo {
        /// Number of people to add
        #[arg(short, long, default_value = "2")]
        people: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Schema {
            config,
            from,
            format,
        } => {
            commands::schema::run(&config, from.as_deref(), &format).await?;
        }
        Commands::Demo { people, format } => {
            commands::demo::run(people, &format).await?;
        }
        Commands::Version => {
            println!("Shelf CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
