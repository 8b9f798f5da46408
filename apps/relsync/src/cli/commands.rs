//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::config::Config;
use crate::daemon::Daemon;
use crate::feed;
use crate::pipeline::{Pipeline, open_queue};
use relsync_core::{
    ActorKey, BulkExtractor, Coalescer, GraphStore, Kind, QueueKey, QueueStats, RedbGraph,
    RetryQueue, SyncError, load_tables,
};
use serde::Serialize;
use std::path::Path;

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create the graph database and the retry queue if missing.
pub fn cmd_init(config: &Config, json_mode: bool) -> Result<(), SyncError> {
    let graph = RedbGraph::open(&config.store.path)?;
    let queue = open_queue(config)?;
    let nodes = graph.node_count()?;
    let pending = queue.len()?;

    if json_mode {
        print_json(&serde_json::json!({
            "database": config.store.path.to_string_lossy(),
            "queue": config.queue.path.to_string_lossy(),
            "node_count": nodes,
            "pending": pending,
        }));
        return Ok(());
    }

    println!("Initialized relsync state");
    println!("  Database: {:?} ({} nodes)", config.store.path, nodes);
    println!("  Queue:    {:?} ({} pending)", config.queue.path, pending);
    Ok(())
}

// =============================================================================
// WATCH COMMAND
// =============================================================================

/// Consume a live feed until it ends.
pub async fn cmd_watch(config: &Config, connect: Option<&str>) -> Result<(), SyncError> {
    let queue = open_queue(config)?;
    let mut coalescer = Coalescer::new(queue, config.registry()?);
    let stats = match connect {
        Some(addr) => feed::run_tcp(addr, &mut coalescer).await?,
        None => feed::run_stdin(&mut coalescer).await?,
    };
    eprintln!(
        "observed {} events: {} enqueued, {} ignored, {} malformed, {} dropped",
        stats.observed, stats.enqueued, stats.ignored, stats.malformed, stats.dropped
    );
    Ok(())
}

// =============================================================================
// PROCESS COMMAND
// =============================================================================

/// Drain the retry queue once or to empty.
pub async fn cmd_process(config: &Config, json_mode: bool, once: bool) -> Result<(), SyncError> {
    let pipeline = Pipeline::from_config(config)?;
    let stats = if once {
        pipeline.drain_once().await?
    } else {
        pipeline.drain_all().await?
    };
    let remaining = pipeline.queue().len()?;

    if json_mode {
        print_json(&serde_json::json!({ "stats": stats, "remaining": remaining }));
        return Ok(());
    }

    println!("Applied:    {}", stats.applied);
    println!("Converged:  {}", stats.converged);
    println!("Stale:      {}", stats.stale);
    println!("Missing:    {}", stats.missing);
    println!("Failed:     {}", stats.failed);
    println!("Edges:      +{} -{}", stats.edges_added, stats.edges_removed);
    println!("Remaining:  {}", remaining);
    Ok(())
}

// =============================================================================
// SWEEP COMMAND
// =============================================================================

/// Run one comparison sweep.
pub async fn cmd_sweep(config: &Config, json_mode: bool) -> Result<(), SyncError> {
    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.sweep_once(config.sweep.batch_size).await?;

    if json_mode {
        print_json(&report);
        return Ok(());
    }

    println!("Actors scanned: {}", report.scanned_actors);
    println!("Batches:        {} ({} failed)", report.batches, report.failed_batches);
    println!("Mismatches:     {}", report.mismatches);
    println!("Enqueued:       {}", report.enqueued);
    Ok(())
}

// =============================================================================
// ENQUEUE COMMAND
// =============================================================================

/// Queue one key by hand.
pub fn cmd_enqueue(config: &Config, actor: &str, kind: u32) -> Result<(), SyncError> {
    let registry = config.registry()?;
    let kind = Kind(kind);
    registry.get(kind)?;
    let key = QueueKey::new(ActorKey::parse(actor)?, kind);

    let queue = open_queue(config)?;
    let item = queue.enqueue_or_replace(&key)?;
    println!("Queued {} (generation {})", item.key, item.enqueued_at);
    Ok(())
}

// =============================================================================
// BULK COMMANDS
// =============================================================================

/// Extract an export into bulk tables.
pub fn cmd_extract(
    config: &Config,
    json_mode: bool,
    input: &Path,
    output: &Path,
) -> Result<(), SyncError> {
    let extractor = BulkExtractor::new(config.registry()?, config.bulk_config());
    let report = extractor.run(input, output)?;

    if json_mode {
        print_json(&report);
    } else {
        println!("Lines:      {} ({} malformed)", report.total_lines, report.malformed_lines);
        println!(
            "Chunks:     {}/{} ({} failed)",
            report.chunks_completed, report.chunks_dispatched, report.failed_chunks
        );
        println!("Nodes:      {}", report.nodes);
        println!("Edges:      {}", report.edges);
        println!("Events:     {}", report.events);
        println!("Elapsed:    {} ms", report.elapsed_ms);
    }

    if !report.complete {
        return Err(SyncError::Io(format!(
            "extraction incomplete; {} left untouched",
            output.display()
        )));
    }
    Ok(())
}

/// Load bulk tables into the graph database.
pub fn cmd_load(config: &Config, json_mode: bool, input: &Path) -> Result<(), SyncError> {
    let registry = config.registry()?;
    let mut graph = RedbGraph::open(&config.store.path)?;
    let report = load_tables(&mut graph, &registry, input)?;

    if json_mode {
        print_json(&report);
        return Ok(());
    }

    println!("Nodes:      {}", report.nodes);
    println!("Events:     {} current of {} rows", report.current_events, report.event_rows);
    println!("Applied:    {}", report.applied);
    println!("Converged:  {}", report.converged);
    println!("Stale:      {}", report.stale);
    println!("Edges:      +{} -{}", report.edges_added, report.edges_removed);
    println!("Skipped:    {} rows", report.skipped_rows);
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show queue and graph status.
pub fn cmd_status(config: &Config, json_mode: bool) -> Result<(), SyncError> {
    let graph = RedbGraph::open(&config.store.path)?;
    let queue = open_queue(config)?;
    let stats = QueueStats::collect(&*queue, config.queue.retry_alert_threshold)?;
    let (nodes, edges) = (graph.node_count()?, graph.edge_count()?);

    if json_mode {
        print_json(&serde_json::json!({
            "database": config.store.path.to_string_lossy(),
            "queue": stats,
            "node_count": nodes,
            "edge_count": edges,
        }));
        return Ok(());
    }

    println!("relsync Status");
    println!("==============");
    println!("Database: {:?}", config.store.path);
    println!("Queue:    {:?}", config.queue.path);
    println!();
    println!("Pending keys:   {}", stats.depth);
    println!("Oldest marker:  {} s", stats.oldest_age_secs);
    println!("Failing keys:   {}", stats.failing_keys);
    println!("Nodes:          {}", nodes);
    println!("Edges:          {}", edges);
    Ok(())
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Run the daemon.
pub async fn cmd_serve(config: &Config, bind: &str, connect: Option<String>) -> Result<(), SyncError> {
    let pipeline = Pipeline::from_config(config)?;

    println!("relsync daemon starting...");
    println!();
    println!("Configuration:");
    println!("  Database: {:?}", config.store.path);
    println!("  Queue:    {:?} ({:?})", config.queue.path, config.queue.backend);
    println!("  Source:   {}", pipeline.source().describe());
    println!("  Bind:     {}", bind);
    println!();
    println!("Endpoints:");
    println!("  GET  /health          - Health check");
    println!("  GET  /status          - Queue and graph status");
    println!("  POST /trigger/sweep   - Queue a comparison sweep");
    println!("  POST /trigger/rebuild - Queue a full rebuild");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    Daemon::from_config(pipeline, config).run(bind, connect).await
}
