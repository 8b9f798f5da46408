//! # relsync
//!
//! Keeps a materialized relationship graph in step with an upstream log of
//! replaceable events.
//!
//! ## Architecture
//!
//! ```text
//!  live feed ──> coalescer ──> retry queue ──> consumer ──> graph store
//!                                   ^              │
//!                    sweep ─────────┘        event source
//!
//!  full export ──> bulk extractor ──> tables ──> bulk loader ──> graph store
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Long-running daemon with a live feed
//! relsync serve --connect 127.0.0.1:7000
//!
//! # One-off operations
//! relsync extract -i export.jsonl -o bulk
//! relsync load -i bulk
//! relsync process
//! relsync status --json
//! ```

use clap::Parser;
use relsync::cli;
use relsync::config::ENV_LOG_FORMAT;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // RELSYNC_LOG_FORMAT=json enables machine-parseable output. Logs go to
    // stderr so `--json` output on stdout stays clean.
    let log_format = std::env::var(ENV_LOG_FORMAT).unwrap_or_else(|_| "text".to_string());

    let default_filter = if cli.verbose {
        "relsync=debug,relsync_core=debug,tower_http=debug"
    } else {
        "relsync=info,relsync_core=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        eprintln!("relsync v{}", env!("CARGO_PKG_VERSION"));
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
