//! # Comparison Sweep
//!
//! The consistency backstop behind the coalescer. For every known actor, in
//! batches, the upstream head (latest event id per watched kind) is compared
//! with the stored checkpoint, and every mismatch is enqueued.
//!
//! The planner is split so that the fetch of heads can live outside this
//! crate: [`SweepPlanner::batches`] yields actor batches, the caller fetches
//! heads for each one however it likes, and [`SweepPlanner::enqueue_mismatches`]
//! does the comparison and the queue writes. [`SweepPlanner::run`] wires the
//! three together for synchronous sources.

use crate::graph::GraphStore;
use crate::queue::RetryQueue;
use crate::relation::RelationRegistry;
use crate::{ActorKey, Checkpoint, Kind, QueueKey, SyncError};
use serde::{Deserialize, Serialize};

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned_actors: u64,
    pub batches: u64,
    /// Batches whose heads could not be fetched; retried next sweep.
    pub failed_batches: u64,
    pub mismatches: u64,
    pub enqueued: u64,
    /// Mismatches whose marker write failed.
    pub dropped: u64,
}

impl SweepReport {
    pub fn merge(&mut self, other: &SweepReport) {
        self.scanned_actors += other.scanned_actors;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.mismatches += other.mismatches;
        self.enqueued += other.enqueued;
        self.dropped += other.dropped;
    }

    /// Whether every batch was compared.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_batches == 0
    }
}

/// Plans and executes comparison sweeps.
#[derive(Debug, Clone)]
pub struct SweepPlanner {
    kinds: Vec<Kind>,
    batch_size: usize,
}

impl SweepPlanner {
    #[must_use]
    pub fn new(registry: &RelationRegistry, batch_size: usize) -> Self {
        Self {
            kinds: registry.watched_kinds(),
            batch_size: batch_size.max(1),
        }
    }

    /// Watched kinds to fetch heads for.
    #[must_use]
    pub fn kinds(&self) -> &[Kind] {
        &self.kinds
    }

    /// Known actors (graph nodes) split into batches.
    pub fn batches<G: GraphStore + ?Sized>(
        &self,
        graph: &G,
    ) -> Result<Vec<Vec<ActorKey>>, SyncError> {
        Ok(graph
            .actors()?
            .chunks(self.batch_size)
            .map(<[ActorKey]>::to_vec)
            .collect())
    }

    /// Keys of `batch` whose upstream head supersedes the checkpoint.
    ///
    /// An actor with a head but no checkpoint is a mismatch. An absent head
    /// never is: there is nothing to converge to. Neither is a head the
    /// checkpoint already supersedes (a lagging relay); the engine would only
    /// drop it as stale.
    pub fn mismatches<G: GraphStore + ?Sized>(
        &self,
        graph: &G,
        heads: &[(QueueKey, Checkpoint)],
    ) -> Result<Vec<QueueKey>, SyncError> {
        let mut keys = Vec::new();
        for (key, head) in heads {
            if !self.kinds.contains(&key.kind) {
                continue;
            }
            match graph.checkpoint(&key.actor, key.kind)? {
                Some(checkpoint) if !head.supersedes(&checkpoint) => {
                    if checkpoint.event_id != head.event_id {
                        tracing::debug!(key = %key, "upstream head behind checkpoint; skipping");
                    }
                }
                _ => keys.push(key.clone()),
            }
        }
        Ok(keys)
    }

    /// Compare one fetched batch and enqueue the mismatches.
    pub fn enqueue_mismatches<G: GraphStore + ?Sized, Q: RetryQueue + ?Sized>(
        &self,
        graph: &G,
        queue: &Q,
        batch: &[ActorKey],
        heads: &[(QueueKey, Checkpoint)],
    ) -> Result<SweepReport, SyncError> {
        let mut report = SweepReport {
            scanned_actors: batch.len() as u64,
            batches: 1,
            ..SweepReport::default()
        };
        for key in self.mismatches(graph, heads)? {
            report.mismatches += 1;
            match queue.enqueue_or_replace(&key) {
                Ok(_) => report.enqueued += 1,
                Err(e) => {
                    report.dropped += 1;
                    tracing::warn!(key = %key, error = %e, "sweep could not enqueue mismatch");
                }
            }
        }
        Ok(report)
    }

    /// Record a batch whose heads could not be fetched.
    #[must_use]
    pub fn failed_batch(batch: &[ActorKey], error: &SyncError) -> SweepReport {
        tracing::warn!(actors = batch.len(), error = %error, "sweep batch skipped");
        SweepReport {
            scanned_actors: 0,
            batches: 1,
            failed_batches: 1,
            ..SweepReport::default()
        }
    }

    /// Full sweep with a synchronous head source.
    pub fn run<G, Q, F>(&self, graph: &G, queue: &Q, mut fetch_heads: F) -> Result<SweepReport, SyncError>
    where
        G: GraphStore + ?Sized,
        Q: RetryQueue + ?Sized,
        F: FnMut(&[ActorKey], &[Kind]) -> Result<Vec<(QueueKey, Checkpoint)>, SyncError>,
    {
        let mut report = SweepReport::default();
        for batch in self.batches(graph)? {
            let batch_report = match fetch_heads(&batch, &self.kinds) {
                Ok(heads) => self.enqueue_mismatches(graph, queue, &batch, &heads)?,
                Err(e) if e.is_retryable() => Self::failed_batch(&batch, &e),
                Err(e) => return Err(e),
            };
            report.merge(&batch_report);
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
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventLog;
    use crate::graph::MemoryGraph;
    use crate::queue::DirQueue;
    use crate::reconcile::Reconciler;
    use crate::{Event, EventId};
    use tempfile::tempdir;

    fn event(id: &str, actor: &str, at: u64) -> Event {
        Event {
            id: EventId::parse(id).expect("id"),
            actor: ActorKey::parse(actor).expect("actor"),
            kind: Kind(3),
            created_at: at,
            tags: vec![vec!["p".into(), "bob".into()]],
        }
    }

    #[test]
    fn sweep_enqueues_only_mismatches() {
        let temp = tempdir().expect("temp dir");
        let queue = DirQueue::open(temp.path()).expect("open");
        let engine = Reconciler::default();
        let mut graph = MemoryGraph::new();
        let mut log = EventLog::new();

        let synced = event("e1", "alice", 10);
        engine.reconcile_event(&mut graph, &synced).expect("apply");
        log.insert(synced);
        // Missed by the coalescer: carol published, graph never saw it.
        engine
            .reconcile_event(&mut graph, &event("c1", "carol", 10))
            .expect("apply");
        log.insert(event("c2", "carol", 20));

        let planner = SweepPlanner::new(&RelationRegistry::default(), 1);
        let report = planner
            .run(&graph, &queue, |actors, kinds| Ok(log.heads(actors, kinds)))
            .expect("sweep");

        // alice, bob (target only, no head), carol
        assert_eq!(report.scanned_actors, 3);
        assert_eq!(report.batches, 3);
        assert_eq!(report.mismatches, 1);
        let pending = queue.list_pending().expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key.actor.as_str(), "carol");
    }

    #[test]
    fn transient_fetch_failure_skips_batch() {
        let temp = tempdir().expect("temp dir");
        let queue = DirQueue::open(temp.path()).expect("open");
        let mut graph = MemoryGraph::new();
        graph
            .ensure_node(&ActorKey::parse("alice").expect("key"))
            .expect("node");

        let planner = SweepPlanner::new(&RelationRegistry::default(), 10);
        let report = planner
            .run(&graph, &queue, |_, _| Err(SyncError::Transient("relay down".into())))
            .expect("sweep");

        assert!(!report.is_complete());
        assert_eq!(report.failed_batches, 1);
        assert!(queue.is_empty().expect("empty"));
    }

    #[test]
    fn lagging_head_is_not_re_enqueued() {
        let temp = tempdir().expect("temp dir");
        let queue = DirQueue::open(temp.path()).expect("open");
        let engine = Reconciler::default();
        let mut graph = MemoryGraph::new();
        engine
            .reconcile_event(&mut graph, &event("e2", "alice", 20))
            .expect("apply");

        // The relay still serves an older replaced event, and a tie the
        // checkpoint wins on id.
        let mut log = EventLog::new();
        log.insert(event("e1", "alice", 10));
        let planner = SweepPlanner::new(&RelationRegistry::default(), 10);
        let behind = planner
            .run(&graph, &queue, |actors, kinds| Ok(log.heads(actors, kinds)))
            .expect("sweep");
        assert_eq!(behind.mismatches, 0);

        let tie = vec![(
            QueueKey::new(ActorKey::parse("alice").expect("key"), Kind(3)),
            Checkpoint::new(EventId::parse("e3").expect("id"), 20),
        )];
        assert!(planner.mismatches(&graph, &tie).expect("compare").is_empty());
        assert!(queue.is_empty().expect("empty"));
    }

    #[test]
    fn head_without_checkpoint_is_a_mismatch() {
        let mut graph = MemoryGraph::new();
        let alice = ActorKey::parse("alice").expect("key");
        graph.ensure_node(&alice).expect("node");
        let planner = SweepPlanner::new(&RelationRegistry::default(), 10);

        let heads = vec![(
            QueueKey::new(alice, Kind(10000)),
            Checkpoint::new(EventId::parse("m1").expect("id"), 5),
        )];
        let keys = planner.mismatches(&graph, &heads).expect("compare");
        assert_eq!(keys.len(), 1);
    }
}
