//! # Graph Store
//!
//! The materialized relationship graph: nodes, typed directed edges and the
//! per-`(actor, kind)` checkpoints recording which event the edges reflect.
//!
//! This module defines the `GraphStore` trait and `MemoryGraph`, the
//! in-memory implementation used by tests and dry runs. All structures use
//! `BTreeMap`/`BTreeSet` for deterministic iteration.

use crate::{ActorKey, Checkpoint, EdgeAttrs, EdgeType, Kind, SyncError};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// GRAPHSTORE TRAIT
// =============================================================================

/// Operations the reconciliation pipeline needs from a graph store.
///
/// Nodes are created implicitly on first reference by an edge or a
/// checkpoint. All fallible operations return `Result<T, SyncError>` so
/// in-memory and persistent backends are interchangeable.
pub trait GraphStore {
    /// Create the node if missing. Returns `true` if it was created.
    fn ensure_node(&mut self, actor: &ActorKey) -> Result<bool, SyncError>;

    /// Read the checkpoint of `(actor, kind)`.
    fn checkpoint(&self, actor: &ActorKey, kind: Kind) -> Result<Option<Checkpoint>, SyncError>;

    /// Advance (or set) the checkpoint of `(actor, kind)`.
    fn set_checkpoint(
        &mut self,
        actor: &ActorKey,
        kind: Kind,
        checkpoint: &Checkpoint,
    ) -> Result<(), SyncError>;

    /// Current target set of `(actor, edge_type)`.
    fn edge_targets(
        &self,
        actor: &ActorKey,
        edge_type: &EdgeType,
    ) -> Result<BTreeSet<ActorKey>, SyncError>;

    /// Attributes of one edge.
    fn edge(
        &self,
        source: &ActorKey,
        edge_type: &EdgeType,
        target: &ActorKey,
    ) -> Result<Option<EdgeAttrs>, SyncError>;

    /// Create-or-update a batch of edges from `source`.
    fn upsert_edges(
        &mut self,
        source: &ActorKey,
        edge_type: &EdgeType,
        edges: &[(ActorKey, EdgeAttrs)],
    ) -> Result<(), SyncError>;

    /// Delete the edges from `source` to every target in `targets`.
    fn delete_edges(
        &mut self,
        source: &ActorKey,
        edge_type: &EdgeType,
        targets: &[ActorKey],
    ) -> Result<(), SyncError>;

    /// All known actors, in key order.
    fn actors(&self) -> Result<Vec<ActorKey>, SyncError>;

    fn node_count(&self) -> Result<usize, SyncError>;

    fn edge_count(&self) -> Result<usize, SyncError>;

    /// Apply one edge delta and advance the checkpoint.
    ///
    /// The default runs the three writes one after the other. They need not
    /// be atomic: a retry recomputes the delta from the graph, so whatever a
    /// failed attempt already wrote drops out of the next delta. Backends
    /// with transactions override this to commit everything at once.
    fn apply_delta(
        &mut self,
        source: &ActorKey,
        kind: Kind,
        edge_type: &EdgeType,
        upserts: &[(ActorKey, EdgeAttrs)],
        removals: &[ActorKey],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(), SyncError> {
        self.ensure_node(source)?;
        if !upserts.is_empty() {
            self.upsert_edges(source, edge_type, upserts)?;
        }
        if !removals.is_empty() {
            self.delete_edges(source, edge_type, removals)?;
        }
        if let Some(checkpoint) = checkpoint {
            self.set_checkpoint(source, kind, checkpoint)?;
        }
        Ok(())
    }
}

// =============================================================================
// MEMORY GRAPH
// =============================================================================

type EdgeKey = (ActorKey, EdgeType, ActorKey);

/// In-memory graph store.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    nodes: BTreeSet<ActorKey>,
    /// (source, type, target) -> attributes. Ordered so that a
    /// `(source, type)` prefix is one contiguous range.
    edges: BTreeMap<EdgeKey, EdgeAttrs>,
    checkpoints: BTreeMap<(ActorKey, Kind), Checkpoint>,
    /// Number of mutating writes performed, for idempotence checks.
    writes: u64,
}

impl MemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating writes applied so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// All edges in deterministic order.
    pub fn edges(&self) -> impl Iterator<Item = (&ActorKey, &EdgeType, &ActorKey, &EdgeAttrs)> {
        self.edges
            .iter()
            .map(|((source, ty, target), attrs)| (source, ty, target, attrs))
    }
}

impl GraphStore for MemoryGraph {
    fn ensure_node(&mut self, actor: &ActorKey) -> Result<bool, SyncError> {
        if self.nodes.contains(actor) {
            return Ok(false);
        }
        self.nodes.insert(actor.clone());
        self.writes += 1;
        Ok(true)
    }

    fn checkpoint(&self, actor: &ActorKey, kind: Kind) -> Result<Option<Checkpoint>, SyncError> {
        Ok(self.checkpoints.get(&(actor.clone(), kind)).cloned())
    }

    fn set_checkpoint(
        &mut self,
        actor: &ActorKey,
        kind: Kind,
        checkpoint: &Checkpoint,
    ) -> Result<(), SyncError> {
        self.ensure_node(actor)?;
        self.checkpoints
            .insert((actor.clone(), kind), checkpoint.clone());
        self.writes += 1;
        Ok(())
    }

    fn edge_targets(
        &self,
        actor: &ActorKey,
        edge_type: &EdgeType,
    ) -> Result<BTreeSet<ActorKey>, SyncError> {
        Ok(self
            .edges
            .keys()
            .filter(|(source, ty, _)| source == actor && ty == edge_type)
            .map(|(_, _, target)| target.clone())
            .collect())
    }

    fn edge(
        &self,
        source: &ActorKey,
        edge_type: &EdgeType,
        target: &ActorKey,
    ) -> Result<Option<EdgeAttrs>, SyncError> {
        Ok(self
            .edges
            .get(&(source.clone(), edge_type.clone(), target.clone()))
            .cloned())
    }

    fn upsert_edges(
        &mut self,
        source: &ActorKey,
        edge_type: &EdgeType,
        edges: &[(ActorKey, EdgeAttrs)],
    ) -> Result<(), SyncError> {
        self.ensure_node(source)?;
        for (target, attrs) in edges {
            self.ensure_node(target)?;
            self.edges.insert(
                (source.clone(), edge_type.clone(), target.clone()),
                attrs.clone(),
            );
            self.writes += 1;
        }
        Ok(())
    }

    fn delete_edges(
        &mut self,
        source: &ActorKey,
        edge_type: &EdgeType,
        targets: &[ActorKey],
    ) -> Result<(), SyncError> {
        for target in targets {
            if self
                .edges
                .remove(&(source.clone(), edge_type.clone(), target.clone()))
                .is_some()
            {
                self.writes += 1;
            }
        }
        Ok(())
    }

    fn actors(&self) -> Result<Vec<ActorKey>, SyncError> {
        Ok(self.nodes.iter().cloned().collect())
    }

    fn node_count(&self) -> Result<usize, SyncError> {
        Ok(self.nodes.len())
    }

    fn edge_count(&self) -> Result<usize, SyncError> {
        Ok(self.edges.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventId;

    fn key(s: &str) -> ActorKey {
        ActorKey::parse(s).expect("key")
    }

    fn follows() -> EdgeType {
        EdgeType::new("FOLLOWS")
    }

    #[test]
    fn upsert_creates_nodes_on_first_reference() {
        let mut graph = MemoryGraph::new();
        graph
            .upsert_edges(&key("alice"), &follows(), &[(key("bob"), EdgeAttrs::new(1, None))])
            .expect("upsert");

        assert_eq!(graph.node_count().expect("count"), 2);
        assert_eq!(graph.edge_count().expect("count"), 1);
    }

    #[test]
    fn edge_targets_are_scoped_by_type() {
        let mut graph = MemoryGraph::new();
        let attrs = EdgeAttrs::new(1, None);
        graph
            .upsert_edges(&key("alice"), &follows(), &[(key("bob"), attrs.clone())])
            .expect("upsert");
        graph
            .upsert_edges(
                &key("alice"),
                &EdgeType::new("MUTES"),
                &[(key("carol"), attrs)],
            )
            .expect("upsert");

        let targets = graph.edge_targets(&key("alice"), &follows()).expect("targets");
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec![key("bob")]);
    }

    #[test]
    fn delete_of_missing_edge_is_not_a_write() {
        let mut graph = MemoryGraph::new();
        graph
            .delete_edges(&key("alice"), &follows(), &[key("bob")])
            .expect("delete");
        assert_eq!(graph.write_count(), 0);
    }

    #[test]
    fn apply_delta_advances_checkpoint() {
        let mut graph = MemoryGraph::new();
        let checkpoint = Checkpoint::new(EventId::parse("e1").expect("id"), 7);
        graph
            .apply_delta(
                &key("alice"),
                Kind(3),
                &follows(),
                &[(key("bob"), EdgeAttrs::new(7, None))],
                &[],
                Some(&checkpoint),
            )
            .expect("apply");

        assert_eq!(
            graph.checkpoint(&key("alice"), Kind(3)).expect("read"),
            Some(checkpoint)
        );
        assert_eq!(
            graph
                .edge(&key("alice"), &follows(), &key("bob"))
                .expect("edge")
                .map(|a| a.created_at),
            Some(7)
        );
    }
}
