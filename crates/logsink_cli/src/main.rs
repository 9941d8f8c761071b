//! logsink CLI
//!
//! Runs the log-to-document-store pipeline and the tools around it.
//!
//! # Commands
//!
//! - `run` - Consume the configured partitions into the document store
//! - `produce` - Append generated events to the log
//! - `init-store` - Create the collection and its seed document
//! - `inspect` - Show cursors, log extents and counts
//! - `dead-letters` - Dump dead-letter records as JSON lines
//! - `reset-cursor` - Set or clear a partition cursor
//! - `compact` - Compact the document log of the collection

mod commands;
mod settings;

use clap::{Parser, Subcommand};
use settings::Settings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Moves events from a partitioned log into a document store.
#[derive(Parser)]
#[command(name = "logsink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(global = true, short, long, env = "LOGSINK_CONFIG", default_value = "logsink.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the configured partitions until Ctrl-C
    Run {
        /// Stop once every partition is drained
        #[arg(long)]
        until_idle: bool,
    },

    /// Append generated events to the log
    Produce {
        /// Number of events to append (runs until Ctrl-C if omitted)
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Pause between events in milliseconds
        #[arg(short, long, env = "SLEEP_INTERVAL_MS", default_value = "5000")]
        interval_ms: u64,

        /// Partition to append to
        #[arg(short, long, default_value = "0")]
        partition: u32,

        /// Make every K-th event malformed
        #[arg(short, long)]
        malformed_every: Option<u64>,
    },

    /// Create the collection and insert the seed document
    InitStore,

    /// Show cursors, log extents and counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump dead-letter records as JSON lines
    DeadLetters {
        /// Only this partition
        #[arg(short, long)]
        partition: Option<u32>,

        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Set or clear the cursor of a partition
    ResetCursor {
        /// Partition to reset
        #[arg(short, long)]
        partition: u32,

        /// Last safe offset to store; clears the cursor if omitted
        #[arg(short, long)]
        offset: Option<u64>,
    },

    /// Compact the document log of the configured collection
    Compact,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("logsink CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::load(&cli.config)?;
    match cli.command {
        Commands::Run { until_idle } => {
            commands::run::run(&settings, until_idle).await?;
        }
        Commands::Produce {
            count,
            interval_ms,
            partition,
            malformed_every,
        } => {
            let options = commands::produce::ProduceOptions {
                count,
                interval: std::time::Duration::from_millis(interval_ms),
                partition,
                malformed_every,
            };
            commands::produce::run(&settings, &options).await?;
        }
        Commands::InitStore => {
            commands::init_store::run(&settings)?;
        }
        Commands::Inspect { format } => {
            commands::inspect::run(&settings, &format)?;
        }
        Commands::DeadLetters { partition, limit } => {
            commands::dead_letters::run(&settings, partition, limit)?;
        }
        Commands::ResetCursor { partition, offset } => {
            commands::reset_cursor::run(&settings, partition, offset)?;
        }
        Commands::Compact => {
            commands::compact::run(&settings)?;
        }
        Commands::Version => {}
    }

    Ok(())
}
