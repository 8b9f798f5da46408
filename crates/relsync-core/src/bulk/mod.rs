//! # Bulk Extractor
//!
//! Cold-start and full-rebuild path. Shards an NDJSON export of every watched
//! event across worker threads and writes three normalized tables for
//! [`load_tables`].
//!
//! ## Run shape
//!
//! 1. Count the non-blank lines of the export.
//! 2. `chunk_size = min(ceil(total / workers), max_chunk_lines)`.
//! 3. Stream the export again, cutting chunks and handing each to a fresh
//!    worker thread. At most `workers` chunks are in flight, which bounds
//!    memory independently of the export size.
//! 4. Each worker returns one [`ChunkResult`] over an mpsc channel. The
//!    coordinator is the only writer: it appends the chunk's rows as soon as
//!    the result arrives and keeps only the actor dedup set in memory.
//! 5. When every dispatched chunk is accounted for, the node table is written
//!    and the run directory replaces the output directory.
//!
//! A failed or panicking worker does not stop the run. Its chunk is counted in
//! `failed_chunks`, the report comes back with `complete = false`, and the
//! output directory is left as it was. Re-running from scratch is always safe.
//!
//! The actor dedup set grows with the number of distinct authors; it is the
//! one structure whose size is not bounded by the chunk limit.

mod loader;
mod worker;
mod writer;

pub use loader::{LoadReport, load_tables};
pub use worker::{Chunk, ChunkResult, EdgeRow, EventRow, extract_chunk};

use crate::ingestor::{LineRead, read_bounded_line, trim_line};
use crate::primitives::{DEFAULT_MAX_CHUNK_LINES, MAX_EVENT_LINE_BYTES};
use crate::relation::RelationRegistry;
use crate::{ActorKey, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use writer::TableWriter;

/// Signature of a chunk processor.
pub type ChunkFn = fn(&RelationRegistry, Chunk) -> Result<ChunkResult, SyncError>;

// =============================================================================
// CONFIG & REPORT
// =============================================================================

/// Tuning of a bulk run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Worker threads; `None` means one less than the available cores.
    pub workers: Option<usize>,
    pub max_chunk_lines: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_chunk_lines: DEFAULT_MAX_CHUNK_LINES,
        }
    }
}

impl BulkConfig {
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(default_workers)
    }
}

/// `max(1, cores - 1)`, leaving a core to the coordinator.
#[must_use]
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Lines per chunk for a run.
#[must_use]
pub fn chunk_size(total_lines: u64, workers: usize, max_chunk_lines: usize) -> usize {
    let per_worker = total_lines.div_ceil(workers.max(1) as u64);
    per_worker.min(max_chunk_lines.max(1) as u64).max(1) as usize
}

/// Outcome of a bulk run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReport {
    pub total_lines: u64,
    pub processed_lines: u64,
    pub malformed_lines: u64,
    pub unwatched_events: u64,
    pub chunks_dispatched: u64,
    pub chunks_completed: u64,
    pub failed_chunks: u64,
    /// Distinct authors written to the node table.
    pub nodes: u64,
    pub edges: u64,
    pub events: u64,
    pub elapsed_ms: u64,
    /// Every chunk succeeded and every counted line was processed.
    pub complete: bool,
}

/// Per-run accumulator owned by the coordinator.
///
/// The author dedup set lives in memory, so a run holds one entry per
/// distinct author in the export.
#[derive(Debug, Default)]
pub struct BulkState {
    actors: BTreeSet<ActorKey>,
    report: BulkReport,
}

impl BulkState {
    #[must_use]
    pub fn new(total_lines: u64) -> Self {
        Self {
            actors: BTreeSet::new(),
            report: BulkReport {
                total_lines,
                ..BulkReport::default()
            },
        }
    }

    /// Fold a finished chunk into the run.
    pub fn absorb(&mut self, result: ChunkResult) {
        let report = &mut self.report;
        report.chunks_completed += 1;
        report.processed_lines += result.lines;
        report.malformed_lines += result.malformed;
        report.unwatched_events += result.unwatched;
        report.events += result.events.len() as u64;
        report.edges += result.edges.len() as u64;
        self.actors.extend(result.actors);
    }

    /// Count a line dropped by the coordinator before chunking.
    pub fn reject_line(&mut self) {
        self.report.processed_lines += 1;
        self.report.malformed_lines += 1;
        tracing::debug!("skipping oversized export line");
    }

    /// Record a chunk that produced no result.
    pub fn fail(&mut self, index: usize, lines: u64, error: &SyncError) {
        self.report.failed_chunks += 1;
        tracing::error!(chunk = index, lines, error = %error, "bulk worker failed; chunk skipped");
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorKey> {
        self.actors.iter()
    }

    /// Close the books on the run.
    #[must_use]
    pub fn finish(&self) -> BulkReport {
        let mut report = self.report.clone();
        report.nodes = self.actors.len() as u64;
        report.complete = report.failed_chunks == 0
            && report.chunks_completed == report.chunks_dispatched
            && report.processed_lines == report.total_lines;
        report
    }
}

// =============================================================================
// EXTRACTOR
// =============================================================================

struct ChunkMessage {
    index: usize,
    lines: u64,
    result: Result<ChunkResult, SyncError>,
}

/// Coordinator of a bulk run.
pub struct BulkExtractor<P = ChunkFn> {
    registry: Arc<RelationRegistry>,
    config: BulkConfig,
    processor: Arc<P>,
}

impl BulkExtractor<ChunkFn> {
    #[must_use]
    pub fn new(registry: RelationRegistry, config: BulkConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            processor: Arc::new(extract_chunk as ChunkFn),
        }
    }
}

impl<P> BulkExtractor<P>
where
    P: Fn(&RelationRegistry, Chunk) -> Result<ChunkResult, SyncError> + Send + Sync + 'static,
{
    /// Replace the chunk processor.
    pub fn with_processor<Q>(self, processor: Q) -> BulkExtractor<Q>
    where
        Q: Fn(&RelationRegistry, Chunk) -> Result<ChunkResult, SyncError> + Send + Sync + 'static,
    {
        BulkExtractor {
            registry: self.registry,
            config: self.config,
            processor: Arc::new(processor),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Extract `input` into the table directory `output`.
    pub fn run(&self, input: &Path, output: &Path) -> Result<BulkReport, SyncError> {
        let started = Instant::now();
        let total_lines = count_lines(input)?;
        let workers = self.config.worker_count();
        let size = chunk_size(total_lines, workers, self.config.max_chunk_lines);
        tracing::info!(
            input = %input.display(),
            total_lines,
            workers,
            chunk_size = size,
            "starting bulk extraction"
        );

        let staging = staging_dir(output)?;
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        let mut writer = TableWriter::create(&staging)?;
        let mut state = BulkState::new(total_lines);

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        let mut in_flight = 0usize;

        let mut reader = BufReader::new(File::open(input)?);
        let mut buf = Vec::new();
        let mut chunk = Chunk {
            index: 0,
            lines: Vec::with_capacity(size),
        };
        loop {
            match read_bounded_line(&mut reader, &mut buf, MAX_EVENT_LINE_BYTES)? {
                LineRead::Eof => break,
                LineRead::Oversized => {
                    state.reject_line();
                    continue;
                }
                LineRead::Line => {}
            }
            let line = trim_line(&buf);
            if line.is_empty() {
                continue;
            }
            chunk.lines.push(line.to_vec());
            if chunk.lines.len() >= size {
                let next = Chunk {
                    index: chunk.index + 1,
                    lines: Vec::with_capacity(size),
                };
                let full = std::mem::replace(&mut chunk, next);
                while in_flight >= workers {
                    Self::collect(&rx, &mut state, &mut writer)?;
                    in_flight -= 1;
                }
                if self.dispatch(full, &tx, &mut handles, &mut state) {
                    in_flight += 1;
                }
            }
        }
        if !chunk.lines.is_empty() {
            while in_flight >= workers {
                Self::collect(&rx, &mut state, &mut writer)?;
                in_flight -= 1;
            }
            if self.dispatch(chunk, &tx, &mut handles, &mut state) {
                in_flight += 1;
            }
        }
        drop(tx);
        while in_flight > 0 {
            Self::collect(&rx, &mut state, &mut writer)?;
            in_flight -= 1;
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("bulk worker thread did not exit cleanly");
            }
        }

        writer.finish(state.actors())?;
        let mut report = state.finish();
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if report.complete {
            if output.exists() {
                fs::remove_dir_all(output)?;
            }
            fs::rename(&staging, output)?;
            tracing::info!(
                output = %output.display(),
                nodes = report.nodes,
                edges = report.edges,
                events = report.events,
                malformed = report.malformed_lines,
                elapsed_ms = report.elapsed_ms,
                "bulk extraction complete"
            );
        } else {
            tracing::error!(
                processed = report.processed_lines,
                total = report.total_lines,
                failed_chunks = report.failed_chunks,
                staging = %staging.display(),
                "bulk extraction incomplete; output left untouched"
            );
        }
        Ok(report)
    }

    /// Hand a chunk to a fresh worker thread. Returns `false` if no thread
    /// could be started, in which case the chunk is already counted failed.
    fn dispatch(
        &self,
        chunk: Chunk,
        tx: &Sender<ChunkMessage>,
        handles: &mut Vec<JoinHandle<()>>,
        state: &mut BulkState,
    ) -> bool {
        let index = chunk.index;
        let lines = chunk.lines.len() as u64;
        let registry = Arc::clone(&self.registry);
        let processor = Arc::clone(&self.processor);
        let tx = tx.clone();
        state.report.chunks_dispatched += 1;

        let spawned = thread::Builder::new()
            .name(format!("bulk-{index}"))
            .spawn(move || {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| (*processor)(registry.as_ref(), chunk)))
                        .unwrap_or_else(|_| {
                            Err(SyncError::Transient(format!("worker for chunk {index} panicked")))
                        });
                // The coordinator only hangs up after an output error.
                let _ = tx.send(ChunkMessage {
                    index,
                    lines,
                    result,
                });
            });
        match spawned {
            Ok(handle) => {
                handles.push(handle);
                true
            }
            Err(e) => {
                state.fail(index, lines, &SyncError::from(e));
                false
            }
        }
    }

    fn collect(
        rx: &Receiver<ChunkMessage>,
        state: &mut BulkState,
        writer: &mut TableWriter,
    ) -> Result<(), SyncError> {
        let message = rx
            .recv()
            .map_err(|_| SyncError::Transient("bulk workers disconnected".into()))?;
        match message.result {
            Ok(result) => {
                writer.append(&result)?;
                state.absorb(result);
                tracing::debug!(
                    chunk = message.index,
                    processed = state.report.processed_lines,
                    total = state.report.total_lines,
                    "chunk merged"
                );
            }
            Err(e) => state.fail(message.index, message.lines, &e),
        }
        Ok(())
    }
}

/// Non-blank lines in a file, oversized ones included.
pub fn count_lines(path: &Path) -> Result<u64, SyncError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut count = 0u64;
    loop {
        match read_bounded_line(&mut reader, &mut buf, MAX_EVENT_LINE_BYTES)? {
            LineRead::Eof => return Ok(count),
            LineRead::Oversized => count += 1,
            LineRead::Line if !trim_line(&buf).is_empty() => count += 1,
            LineRead::Line => {}
        }
    }
}

/// Sibling directory a run writes into before it is renamed into place.
fn staging_dir(output: &Path) -> Result<PathBuf, SyncError> {
    let name = output
        .file_name()
        .ok_or_else(|| SyncError::Config(format!("invalid output path {}", output.display())))?;
    let mut staged = name.to_os_string();
    staged.push(".partial");
    Ok(output.with_file_name(staged))
}

// =============================================================================
// TESTS
// =============================================================================
