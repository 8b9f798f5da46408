//! # Diff-and-Apply Engine
//!
//! Given a queue key and the authoritative latest event for it, bring the
//! graph's edges of the matching type in line with the event's tags and
//! advance the checkpoint.
//!
//! The delta is recomputed from the graph on every call, which is what makes
//! replay after a partial failure safe: an edge already written by a failed
//! attempt is no longer in `to_add`, an edge already deleted is no longer in
//! `to_remove`. The checkpoint is the last write, so a checkpoint equal to the
//! latest event id means the previous apply finished.

use crate::graph::GraphStore;
use crate::relation::RelationRegistry;
use crate::{ActorKey, Checkpoint, EdgeAttrs, Event, QueueKey, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// POLICY & OUTCOME
// =============================================================================

/// What to do when a queued key has no current event upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingEventPolicy {
    /// Leave edges and checkpoint untouched and log a warning.
    #[default]
    Ignore,
    /// Remove every edge of the kind's type. The checkpoint is not touched.
    #[serde(rename = "revoke", alias = "revoke_all")]
    RevokeAll,
}

/// Result of reconciling one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Delta written and checkpoint advanced.
    Applied {
        added: usize,
        removed: usize,
        checkpoint: Checkpoint,
    },
    /// The checkpoint already names the latest event.
    AlreadyConverged,
    /// The fetched event is older than the checkpoint. Nothing written.
    Stale,
    /// No current event upstream; `revoked` edges removed under
    /// [`MissingEventPolicy::RevokeAll`].
    MissingEvent { revoked: usize },
}

impl ApplyOutcome {
    /// Number of edge writes the outcome implies.
    #[must_use]
    pub fn edge_writes(&self) -> usize {
        match self {
            ApplyOutcome::Applied { added, removed, .. } => added + removed,
            ApplyOutcome::MissingEvent { revoked } => *revoked,
            ApplyOutcome::AlreadyConverged | ApplyOutcome::Stale => 0,
        }
    }
}

// =============================================================================
// DELTA
// =============================================================================

/// Add and remove sets for one `(actor, type)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeDelta {
    /// `T - C` with the attributes each new edge carries, in key order.
    pub to_add: Vec<(ActorKey, EdgeAttrs)>,
    /// `C - T`, in key order.
    pub to_remove: Vec<ActorKey>,
}

impl EdgeDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Diff the authoritative target set `target` against the graph's `current`.
#[must_use]
pub fn compute_delta(
    target: &BTreeMap<ActorKey, EdgeAttrs>,
    current: &BTreeSet<ActorKey>,
) -> EdgeDelta {
    let to_add = target
        .iter()
        .filter(|(actor, _)| !current.contains(*actor))
        .map(|(actor, attrs)| (actor.clone(), attrs.clone()))
        .collect();
    let to_remove = current
        .iter()
        .filter(|actor| !target.contains_key(*actor))
        .cloned()
        .collect();
    EdgeDelta { to_add, to_remove }
}

// =============================================================================
// RECONCILER
// =============================================================================

/// The diff-and-apply engine.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    registry: RelationRegistry,
    policy: MissingEventPolicy,
}

impl Reconciler {
    #[must_use]
    pub fn new(registry: RelationRegistry, policy: MissingEventPolicy) -> Self {
        Self { registry, policy }
    }

    #[must_use]
    pub fn registry(&self) -> &RelationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn policy(&self) -> MissingEventPolicy {
        self.policy
    }

    /// Reconcile `key` against `latest`, the current upstream event for it.
    pub fn reconcile<G: GraphStore + ?Sized>(
        &self,
        graph: &mut G,
        key: &QueueKey,
        latest: Option<&Event>,
    ) -> Result<ApplyOutcome, SyncError> {
        let relation = self.registry.get(key.kind)?;
        let actor = &key.actor;

        let Some(latest) = latest else {
            return self.handle_missing(graph, key);
        };
        if latest.actor != *actor || latest.kind != key.kind {
            return Err(SyncError::MalformedEvent(format!(
                "event {} belongs to {}, not {key}",
                latest.id,
                latest.key()
            )));
        }

        let head = latest.head();
        if let Some(checkpoint) = graph.checkpoint(actor, key.kind)? {
            if checkpoint.event_id == head.event_id {
                tracing::debug!(key = %key, event = %head.event_id, "already converged");
                return Ok(ApplyOutcome::AlreadyConverged);
            }
            if !head.supersedes(&checkpoint) {
                tracing::debug!(
                    key = %key,
                    event = %head.event_id,
                    checkpoint = %checkpoint.event_id,
                    "fetched event is older than checkpoint"
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        let target = relation.targets(latest);
        let current = graph.edge_targets(actor, &relation.edge_type)?;
        let delta = compute_delta(&target, &current);

        graph.apply_delta(
            actor,
            key.kind,
            &relation.edge_type,
            &delta.to_add,
            &delta.to_remove,
            Some(&head),
        )?;

        if target.is_empty() {
            tracing::info!(key = %key, removed = delta.to_remove.len(), "event asserts no targets; revoked all");
        }
        tracing::debug!(
            key = %key,
            event = %head.event_id,
            added = delta.to_add.len(),
            removed = delta.to_remove.len(),
            "applied edge delta"
        );
        Ok(ApplyOutcome::Applied {
            added: delta.to_add.len(),
            removed: delta.to_remove.len(),
            checkpoint: head,
        })
    }

    /// Reconcile the key an event belongs to with that event as current.
    pub fn reconcile_event<G: GraphStore + ?Sized>(
        &self,
        graph: &mut G,
        event: &Event,
    ) -> Result<ApplyOutcome, SyncError> {
        self.reconcile(graph, &event.key(), Some(event))
    }

    fn handle_missing<G: GraphStore + ?Sized>(
        &self,
        graph: &mut G,
        key: &QueueKey,
    ) -> Result<ApplyOutcome, SyncError> {
        let error = SyncError::MissingAuthoritativeEvent {
            actor: key.actor.clone(),
            kind: key.kind,
        };
        match self.policy {
            MissingEventPolicy::Ignore => {
                tracing::warn!(key = %key, "{error}; leaving edges untouched");
                Ok(ApplyOutcome::MissingEvent { revoked: 0 })
            }
            MissingEventPolicy::RevokeAll => {
                let relation = self.registry.get(key.kind)?;
                let current: Vec<ActorKey> = graph
                    .edge_targets(&key.actor, &relation.edge_type)?
                    .into_iter()
                    .collect();
                if !current.is_empty() {
                    graph.apply_delta(
                        &key.actor,
                        key.kind,
                        &relation.edge_type,
                        &[],
                        &current,
                        None,
                    )?;
                }
                tracing::warn!(key = %key, revoked = current.len(), "{error}; revoked edges");
                Ok(ApplyOutcome::MissingEvent {
                    revoked: current.len(),
                })
            }
        }
    }
}

// =============================================================================
// STATS
// =============================================================================

/// Aggregate of a drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub applied: u64,
    pub converged: u64,
    pub stale: u64,
    pub missing: u64,
    pub failed: u64,
    pub edges_added: u64,
    pub edges_removed: u64,
}

impl ReconcileStats {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied { added, removed, .. } => {
                self.applied += 1;
                self.edges_added += *added as u64;
                self.edges_removed += *removed as u64;
            }
            ApplyOutcome::AlreadyConverged => self.converged += 1,
            ApplyOutcome::Stale => self.stale += 1,
            ApplyOutcome::MissingEvent { revoked } => {
                self.missing += 1;
                self.edges_removed += *revoked as u64;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn merge(&mut self, other: &ReconcileStats) {
        self.applied += other.applied;
        self.converged += other.converged;
        self.stale += other.stale;
        self.missing += other.missing;
        self.failed += other.failed;
        self.edges_added += other.edges_added;
        self.edges_removed += other.edges_removed;
    }

    /// Keys handled without error.
    #[must_use]
    pub fn settled(&self) -> u64 {
        self.applied + self.converged + self.stale + self.missing
    }
}

// =============================================================================
// TESTS
// =============================================================================
