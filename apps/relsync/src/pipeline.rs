//! # Pipeline
//!
//! The async side of reconciliation: drains the retry queue with bounded
//! concurrency, runs comparison sweeps against the event source, and runs
//! full rebuilds from an export.
//!
//! ## Locking
//!
//! The graph sits behind one `tokio::sync::RwLock`. An apply takes the write
//! guard only for the synchronous diff-and-apply; the upstream fetch for the
//! key happens before, without any lock. Two applies for the same key never
//! overlap: the queue holds one marker per key and the [`ClaimSet`] refuses
//! a second claim within this process.

use crate::config::{Config, QueueBackend};
use crate::source::{EventSource, Source};
use relsync_core::{
    ApplyOutcome, BulkConfig, BulkExtractor, BulkReport, ClaimSet, DirQueue, GraphStore,
    LoadReport, QueueItem, QueueStats, ReconcileStats, Reconciler, RedbGraph, RedbQueue,
    RetryQueue, SweepPlanner, SweepReport, SyncError, load_tables,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;

/// The graph store shared by every task.
pub type SharedGraph = Arc<RwLock<dyn GraphStore + Send + Sync>>;

/// The retry queue shared by every task.
pub type SharedQueue = Arc<dyn RetryQueue>;

/// Open the configured retry queue.
pub fn open_queue(config: &Config) -> Result<SharedQueue, SyncError> {
    let queue: SharedQueue = match config.queue.backend {
        QueueBackend::Dir => Arc::new(DirQueue::open(&config.queue.path)?) as SharedQueue,
        QueueBackend::Redb => Arc::new(RedbQueue::open(&config.queue.path)?) as SharedQueue,
    };
    Ok(queue)
}

/// Open the configured graph database.
pub fn open_graph(config: &Config) -> Result<SharedGraph, SyncError> {
    let graph: SharedGraph = Arc::new(RwLock::new(RedbGraph::open(&config.store.path)?));
    Ok(graph)
}

/// Drain tuning.
#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub retry_alert_threshold: u32,
}

impl DrainSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.queue.concurrency,
            batch_size: config.queue.batch_size,
            retry_alert_threshold: config.queue.retry_alert_threshold,
        }
    }
}

/// Everything a drain, sweep or rebuild needs. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    graph: SharedGraph,
    queue: SharedQueue,
    source: Arc<Source>,
    reconciler: Arc<Reconciler>,
    claims: ClaimSet,
    settings: DrainSettings,
}

impl Pipeline {
    pub fn new(
        graph: SharedGraph,
        queue: SharedQueue,
        source: Source,
        reconciler: Reconciler,
        settings: DrainSettings,
    ) -> Self {
        Self {
            graph,
            queue,
            source: Arc::new(source),
            reconciler: Arc::new(reconciler),
            claims: ClaimSet::new(),
            settings,
        }
    }

    /// Build from configuration: opens the store, the queue and the source.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let reconciler = Reconciler::new(config.registry()?, config.engine.missing_event_policy);
        Ok(Self::new(
            open_graph(config)?,
            open_queue(config)?,
            Source::from_config(&config.source)?,
            reconciler,
            DrainSettings::from_config(config),
        ))
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        QueueStats::collect(&*self.queue, self.settings.retry_alert_threshold)
    }

    // =========================================================================
    // QUEUE DRAIN
    // =========================================================================

    /// Process one batch of pending keys, at most `concurrency` at a time.
    pub async fn drain_once(&self) -> Result<ReconcileStats, SyncError> {
        let pending = self.queue.list_pending()?;
        let mut stats = ReconcileStats::default();
        if pending.is_empty() {
            return Ok(stats);
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for item in pending.into_iter().take(self.settings.batch_size) {
            let Some(claim) = self.claims.try_claim(&item.key) else {
                tracing::debug!(key = %item.key, "key already claimed, skipping");
                continue;
            };
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| SyncError::Transient(e.to_string()))?;
            let pipeline = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _claim = claim;
                pipeline.process_item(&item).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => stats.record(&outcome),
                Ok(Err(_)) => stats.record_failure(),
                Err(e) => {
                    tracing::error!(error = %e, "apply task aborted");
                    stats.record_failure();
                }
            }
        }

        tracing::info!(
            applied = stats.applied,
            converged = stats.converged,
            stale = stats.stale,
            missing = stats.missing,
            failed = stats.failed,
            added = stats.edges_added,
            removed = stats.edges_removed,
            "drain pass finished"
        );
        Ok(stats)
    }

    /// Drain until the queue is empty or a pass settles nothing.
    pub async fn drain_all(&self) -> Result<ReconcileStats, SyncError> {
        let mut total = ReconcileStats::default();
        loop {
            let pass = self.drain_once().await?;
            total.merge(&pass);
            if pass.settled() == 0 || self.queue.is_empty()? {
                return Ok(total);
            }
        }
    }

    /// Fetch, apply and ack one marker.
    ///
    /// Retryable failures leave the marker in place with its attempt count
    /// raised. Anything else cannot succeed on retry, so the marker is
    /// acked and the sweep left to recover.
    async fn process_item(&self, item: &QueueItem) -> Result<ApplyOutcome, SyncError> {
        let result = match self.source.latest(&item.key).await {
            Ok(latest) => {
                let mut graph = self.graph.write().await;
                self.reconciler
                    .reconcile(&mut *graph, &item.key, latest.as_ref())
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                if !self.queue.ack(item)? {
                    tracing::debug!(key = %item.key, "marker replaced during apply, kept");
                }
                tracing::debug!(key = %item.key, outcome = ?outcome, "key reconciled");
                Ok(outcome)
            }
            Err(e) if e.is_retryable() => {
                let attempts = self.queue.record_failure(item)?;
                if attempts >= self.settings.retry_alert_threshold {
                    tracing::error!(key = %item.key, attempts, error = %e, "key keeps failing");
                } else {
                    tracing::warn!(key = %item.key, attempts, error = %e, "apply failed, will retry");
                }
                Err(e)
            }
            Err(e) => {
                tracing::warn!(key = %item.key, error = %e, "dropping key that cannot be applied");
                self.queue.ack(item)?;
                Err(e)
            }
        }
    }

    // =========================================================================
    // SWEEP
    // =========================================================================

    /// Compare upstream heads with checkpoints and enqueue every mismatch.
    pub async fn sweep_once(&self, batch_size: usize) -> Result<SweepReport, SyncError> {
        let planner = SweepPlanner::new(self.reconciler.registry(), batch_size);
        let batches = {
            let graph = self.graph.read().await;
            planner.batches(&*graph)?
        };

        let mut report = SweepReport::default();
        for batch in batches {
            let part = match self.source.heads(&batch, planner.kinds()).await {
                Ok(heads) => {
                    let graph = self.graph.read().await;
                    planner.enqueue_mismatches(&*graph, &*self.queue, &batch, &heads)?
                }
                Err(e) if e.is_retryable() => SweepPlanner::failed_batch(&batch, &e),
                Err(e) => return Err(e),
            };
            report.merge(&part);
        }
        tracing::info!(
            actors = report.scanned_actors,
            mismatches = report.mismatches,
            enqueued = report.enqueued,
            failed_batches = report.failed_batches,
            "sweep finished"
        );
        Ok(report)
    }

    // =========================================================================
    // REBUILD
    // =========================================================================

    /// Extract `input` into `output` and load the tables into the graph.
    ///
    /// An incomplete extraction is not loaded; the previous tables stay.
    pub async fn rebuild(
        &self,
        input: &Path,
        output: &Path,
        config: BulkConfig,
    ) -> Result<Rebuild, SyncError> {
        let registry = self.reconciler.registry().clone();
        let (input_owned, output_owned): (PathBuf, PathBuf) = (input.into(), output.into());
        let extract = tokio::task::spawn_blocking(move || {
            BulkExtractor::new(registry, config).run(&input_owned, &output_owned)
        })
        .await
        .map_err(|e| SyncError::Io(format!("bulk extraction task: {e}")))??;

        if !extract.complete {
            return Ok(Rebuild {
                extract,
                load: None,
            });
        }

        let load = {
            let mut graph = self.graph.write().await;
            load_tables(&mut *graph, self.reconciler.registry(), output)?
        };
        tracing::info!(
            nodes = load.nodes,
            applied = load.applied,
            edges_added = load.edges_added,
            "bulk load finished"
        );
        Ok(Rebuild {
            extract,
            load: Some(load),
        })
    }
}

/// Result of a rebuild.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Rebuild {
    pub extract: BulkReport,
    /// `None` when the extraction was incomplete and nothing was loaded.
    pub load: Option<LoadReport>,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileEventSource;
    use relsync_core::{
        ActorKey, EdgeType, Event, EventId, EventLog, Kind, MemoryGraph, QueueKey,
    };

    fn follow_list(id: &str, actor: &str, at: u64, targets: &[&str]) -> Event {
        Event {
            id: EventId::parse(id).expect("id"),
            actor: ActorKey::parse(actor).expect("actor"),
            kind: Kind(3),
            created_at: at,
            tags: targets
                .iter()
                .map(|t| vec!["p".to_string(), (*t).to_string()])
                .collect(),
        }
    }

    fn key(actor: &str) -> QueueKey {
        QueueKey::new(ActorKey::parse(actor).expect("actor"), Kind(3))
    }

    fn pipeline(dir: &Path, events: Vec<Event>) -> Pipeline {
        let mut log = EventLog::new();
        for event in events {
            log.insert(event);
        }
        let graph: SharedGraph = Arc::new(RwLock::new(MemoryGraph::new()));
        let queue: SharedQueue = Arc::new(DirQueue::open(dir).expect("queue"));
        Pipeline::new(
            graph,
            queue,
            Source::File(FileEventSource::from_log(log)),
            Reconciler::default(),
            DrainSettings {
                concurrency: 5,
                batch_size: 100,
                retry_alert_threshold: 3,
            },
        )
    }

    async fn follows(pipeline: &Pipeline, actor: &str) -> Vec<String> {
        let graph = pipeline.graph().read().await;
        graph
            .edge_targets(&ActorKey::parse(actor).expect("a"), &EdgeType::new("FOLLOWS"))
            .expect("targets")
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn drain_applies_and_acks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let events: Vec<Event> = (0..20)
            .map(|i| follow_list(&format!("e{i}"), &format!("a{i}"), 1, &["x", "y"]))
            .collect();
        let pipeline = pipeline(dir.path(), events);
        for i in 0..20 {
            pipeline.queue().enqueue_or_replace(&key(&format!("a{i}"))).expect("enqueue");
        }

        let stats = pipeline.drain_once().await.expect("drain");
        assert_eq!(stats.applied, 20);
        assert_eq!(stats.edges_added, 40);
        assert!(pipeline.queue().is_empty().expect("empty"));
        assert_eq!(follows(&pipeline, "a7").await, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn missing_event_is_acked_without_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(dir.path(), Vec::new());
        pipeline.queue().enqueue_or_replace(&key("ghost")).expect("enqueue");

        let stats = pipeline.drain_all().await.expect("drain");
        assert_eq!(stats.missing, 1);
        assert!(pipeline.queue().is_empty().expect("empty"));
        let graph = pipeline.graph().read().await;
        assert_eq!(graph.node_count().expect("nodes"), 0);
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(dir.path(), Vec::new());
        let odd = QueueKey::new(ActorKey::parse("alice").expect("a"), Kind(7));
        pipeline.queue().enqueue_or_replace(&odd).expect("enqueue");

        let stats = pipeline.drain_once().await.expect("drain");
        assert_eq!(stats.failed, 1);
        assert!(pipeline.queue().is_empty().expect("empty"));
    }

    #[tokio::test]
    async fn sweep_finds_upstream_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(dir.path(), vec![follow_list("e1", "alice", 1, &["bob"])]);
        pipeline.queue().enqueue_or_replace(&key("alice")).expect("enqueue");
        pipeline.drain_all().await.expect("drain");

        // The live feed missed this update.
        if let Source::File(source) = pipeline.source() {
            source.insert(follow_list("e2", "alice", 2, &["carol"]));
        }

        let report = pipeline.sweep_once(10).await.expect("sweep");
        assert_eq!(report.enqueued, 1);
        pipeline.drain_all().await.expect("drain");
        assert_eq!(follows(&pipeline, "alice").await, vec!["carol"]);

        let again = pipeline.sweep_once(10).await.expect("sweep");
        assert_eq!(again.mismatches, 0);
    }
}
