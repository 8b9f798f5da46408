//! # relsync CLI Module
//!
//! This module implements the command line interface.
//!
//! ## Available Commands
//!
//! - `init` - Create the graph database and the retry queue
//! - `watch` - Feed a live event stream into the retry queue
//! - `process` - Drain the retry queue
//! - `sweep` - Compare upstream heads with checkpoints once
//! - `enqueue` - Queue one `(actor, kind)` by hand
//! - `extract` - Extract a full export into bulk tables
//! - `load` - Load bulk tables into the graph
//! - `status` - Queue depth, failing keys, graph size
//! - `serve` - Run the daemon

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use relsync_core::SyncError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// relsync - keeps a relationship graph in step with replaceable events
#[derive(Parser, Debug)]
#[command(name = "relsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "relsync.toml")]
    pub config: PathBuf,

    /// Graph database path (overrides store.path)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long = "json", global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the graph database and the retry queue
    Init,

    /// Feed a live NDJSON event stream into the retry queue
    Watch {
        /// Read from a TCP feed instead of stdin
        #[arg(long)]
        connect: Option<String>,
    },

    /// Drain the retry queue
    Process {
        /// Run a single batch instead of draining to empty
        #[arg(long)]
        once: bool,
    },

    /// Run one comparison sweep and enqueue mismatches
    Sweep,

    /// Queue one (actor, kind) for reconciliation
    Enqueue {
        actor: String,
        kind: u32,
    },

    /// Extract a full NDJSON export into bulk tables
    Extract {
        /// Export file (one event per line)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (defaults to bulk.output)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load extracted bulk tables into the graph
    Load {
        /// Table directory (defaults to bulk.output)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Show queue and graph status
    Status,

    /// Run the daemon
    Serve {
        /// Endpoint bind address (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,

        /// Live feed address to consume
        #[arg(long)]
        connect: Option<String>,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Load configuration with CLI overrides applied.
pub fn load_config(cli: &Cli) -> Result<Config, SyncError> {
    let mut config = Config::load(&cli.config)?;
    if let Some(database) = &cli.database {
        config.store.path = database.clone();
    }
    Ok(config)
}

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), SyncError> {
    let config = load_config(&cli)?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init) => cmd_init(&config, json_mode),
        Some(Commands::Watch { connect }) => cmd_watch(&config, connect.as_deref()).await,
        Some(Commands::Process { once }) => cmd_process(&config, json_mode, once).await,
        Some(Commands::Sweep) => cmd_sweep(&config, json_mode).await,
        Some(Commands::Enqueue { actor, kind }) => cmd_enqueue(&config, &actor, kind),
        Some(Commands::Extract { input, output }) => {
            let output = output.unwrap_or_else(|| config.bulk.output.clone());
            cmd_extract(&config, json_mode, &input, &output)
        }
        Some(Commands::Load { input }) => {
            let input = input.unwrap_or_else(|| config.bulk.output.clone());
            cmd_load(&config, json_mode, &input)
        }
        Some(Commands::Status) => cmd_status(&config, json_mode),
        Some(Commands::Serve { bind, connect }) => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            cmd_serve(&config, &bind, connect).await
        }
        None => cmd_status(&config, json_mode),
    }
}
