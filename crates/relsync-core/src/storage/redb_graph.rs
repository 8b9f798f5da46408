//! # redb-backed Graph Storage
//!
//! A disk-backed graph store using the redb embedded database:
//! - ACID transactions
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! ## Layout
//!
//! | Table         | Key                        | Value                  |
//! |---------------|----------------------------|------------------------|
//! | `nodes`       | actor                      | `()`                   |
//! | `edges`       | (source, type, target)     | postcard `EdgeAttrs`   |
//! | `checkpoints` | (actor, kind)              | postcard `Checkpoint`  |
//! | `metadata`    | name                       | u64                    |
//!
//! Edge keys sort by source then type, so the target set of
//! `(actor, type)` is a single range scan.

use crate::graph::GraphStore;
use crate::{ActorKey, Checkpoint, EdgeAttrs, EdgeType, Kind, SyncError};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeSet;
use std::path::Path;

/// Table for nodes: actor key -> unit
const NODES: TableDefinition<&str, ()> = TableDefinition::new("nodes");

/// Table for edges: (source, edge type, target) -> serialized EdgeAttrs
const EDGES: TableDefinition<(&str, &str, &str), &[u8]> = TableDefinition::new("edges");

/// Table for checkpoints: (actor, kind) -> serialized Checkpoint
const CHECKPOINTS: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("checkpoints");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

/// On-disk layout version, bumped on incompatible table changes.
const SCHEMA_VERSION: u64 = 1;

fn read_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Transient(e.to_string())
}

fn write_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::StoreWrite(e.to_string())
}

/// A disk-backed graph store using redb.
pub struct RedbGraph {
    db: Database,
}

impl std::fmt::Debug for RedbGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbGraph").finish_non_exhaustive()
    }
}

impl RedbGraph {
    /// Open or create a graph database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let db = Database::create(path.as_ref()).map_err(|e| SyncError::Io(e.to_string()))?;

        let write_txn = db.begin_write().map_err(write_err)?;
        {
            let _ = write_txn.open_table(NODES).map_err(write_err)?;
            let _ = write_txn.open_table(EDGES).map_err(write_err)?;
            let _ = write_txn.open_table(CHECKPOINTS).map_err(write_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(write_err)?;
            let stored = meta
                .get("schema_version")
                .map_err(read_err)?
                .map(|v| v.value());
            match stored {
                None => {
                    meta.insert("schema_version", SCHEMA_VERSION)
                        .map_err(write_err)?;
                }
                Some(v) if v != SCHEMA_VERSION => {
                    return Err(SyncError::Config(format!(
                        "graph database schema {v} is not supported (expected {SCHEMA_VERSION})"
                    )));
                }
                Some(_) => {}
            }
        }
        write_txn.commit().map_err(write_err)?;

        Ok(Self { db })
    }

    /// All edges in key order: (source, type, target, attributes).
    pub fn edges(&self) -> Result<Vec<(ActorKey, EdgeType, ActorKey, EdgeAttrs)>, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(EDGES).map_err(read_err)?;

        let mut edges = Vec::new();
        for entry in table.iter().map_err(read_err)? {
            let (key, value) = entry.map_err(read_err)?;
            let (source, ty, target) = key.value();
            edges.push((
                ActorKey::parse(source)?,
                EdgeType::new(ty),
                ActorKey::parse(target)?,
                decode_attrs(value.value())?,
            ));
        }
        Ok(edges)
    }
}

fn decode_attrs(bytes: &[u8]) -> Result<EdgeAttrs, SyncError> {
    postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    postcard::to_allocvec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Insert nodes that are not present yet, inside an open write transaction.
macro_rules! ensure_nodes {
    ($nodes:expr, $actors:expr) => {{
        let mut created = 0usize;
        for actor in $actors {
            if $nodes.get(actor.as_str()).map_err(read_err)?.is_none() {
                $nodes.insert(actor.as_str(), ()).map_err(write_err)?;
                created += 1;
            }
        }
        created
    }};
}

// =============================================================================
// GRAPHSTORE TRAIT IMPLEMENTATION
// =============================================================================

impl GraphStore for RedbGraph {
    fn ensure_node(&mut self, actor: &ActorKey) -> Result<bool, SyncError> {
        let write_txn = self.db.begin_write().map_err(write_err)?;
        let created = {
            let mut nodes = write_txn.open_table(NODES).map_err(write_err)?;
            ensure_nodes!(nodes, [actor])
        };
        write_txn.commit().map_err(write_err)?;
        Ok(created > 0)
    }

    fn checkpoint(&self, actor: &ActorKey, kind: Kind) -> Result<Option<Checkpoint>, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(CHECKPOINTS).map_err(read_err)?;
        match table.get((actor.as_str(), kind.0)).map_err(read_err)? {
            Some(value) => postcard::from_bytes(value.value())
                .map(Some)
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn set_checkpoint(
        &mut self,
        actor: &ActorKey,
        kind: Kind,
        checkpoint: &Checkpoint,
    ) -> Result<(), SyncError> {
        let bytes = encode(checkpoint)?;
        let write_txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut nodes = write_txn.open_table(NODES).map_err(write_err)?;
            ensure_nodes!(nodes, [actor]);
            let mut table = write_txn.open_table(CHECKPOINTS).map_err(write_err)?;
            table
                .insert((actor.as_str(), kind.0), bytes.as_slice())
                .map_err(write_err)?;
        }
        write_txn.commit().map_err(write_err)
    }

    fn edge_targets(
        &self,
        actor: &ActorKey,
        edge_type: &EdgeType,
    ) -> Result<BTreeSet<ActorKey>, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(EDGES).map_err(read_err)?;

        let mut targets = BTreeSet::new();
        let start = (actor.as_str(), edge_type.as_str(), "");
        for entry in table.range(start..).map_err(read_err)? {
            let (key, _) = entry.map_err(read_err)?;
            let (source, ty, target) = key.value();
            if source != actor.as_str() || ty != edge_type.as_str() {
                break;
            }
            targets.insert(ActorKey::parse(target)?);
        }
        Ok(targets)
    }

    fn edge(
        &self,
        source: &ActorKey,
        edge_type: &EdgeType,
        target: &ActorKey,
    ) -> Result<Option<EdgeAttrs>, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(EDGES).map_err(read_err)?;
        match table
            .get((source.as_str(), edge_type.as_str(), target.as_str()))
            .map_err(read_err)?
        {
            Some(value) => decode_attrs(value.value()).map(Some),
            None => Ok(None),
        }
    }

    fn upsert_edges(
        &mut self,
        source: &ActorKey,
        edge_type: &EdgeType,
        edges: &[(ActorKey, EdgeAttrs)],
    ) -> Result<(), SyncError> {
        self.apply_delta(source, Kind::default(), edge_type, edges, &[], None)
    }

    fn delete_edges(
        &mut self,
        source: &ActorKey,
        edge_type: &EdgeType,
        targets: &[ActorKey],
    ) -> Result<(), SyncError> {
        self.apply_delta(source, Kind::default(), edge_type, &[], targets, None)
    }

    fn actors(&self) -> Result<Vec<ActorKey>, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(NODES).map_err(read_err)?;

        let mut actors = Vec::new();
        for entry in table.iter().map_err(read_err)? {
            let (key, _) = entry.map_err(read_err)?;
            actors.push(ActorKey::parse(key.value())?);
        }
        Ok(actors)
    }

    fn node_count(&self) -> Result<usize, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(NODES).map_err(read_err)?;
        Ok(table.len().map_err(read_err)? as usize)
    }

    fn edge_count(&self) -> Result<usize, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(EDGES).map_err(read_err)?;
        Ok(table.len().map_err(read_err)? as usize)
    }

    /// Upserts, deletes and the checkpoint advance commit in one transaction.
    fn apply_delta(
        &mut self,
        source: &ActorKey,
        kind: Kind,
        edge_type: &EdgeType,
        upserts: &[(ActorKey, EdgeAttrs)],
        removals: &[ActorKey],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(), SyncError> {
        let write_txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut nodes = write_txn.open_table(NODES).map_err(write_err)?;
            ensure_nodes!(
                nodes,
                std::iter::once(source).chain(upserts.iter().map(|(target, _)| target))
            );

            let mut edges = write_txn.open_table(EDGES).map_err(write_err)?;
            for (target, attrs) in upserts {
                let bytes = encode(attrs)?;
                edges
                    .insert(
                        (source.as_str(), edge_type.as_str(), target.as_str()),
                        bytes.as_slice(),
                    )
                    .map_err(write_err)?;
            }
            for target in removals {
                edges
                    .remove((source.as_str(), edge_type.as_str(), target.as_str()))
                    .map_err(write_err)?;
            }

            if let Some(checkpoint) = checkpoint {
                let bytes = encode(checkpoint)?;
                let mut checkpoints = write_txn.open_table(CHECKPOINTS).map_err(write_err)?;
                checkpoints
                    .insert((source.as_str(), kind.0), bytes.as_slice())
                    .map_err(write_err)?;
            }
        }
        write_txn.commit().map_err(write_err)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::EventId;
    use tempfile::tempdir;

    fn key(s: &str) -> ActorKey {
        ActorKey::parse(s).expect("key")
    }

    fn follows() -> EdgeType {
        EdgeType::new("FOLLOWS")
    }

    #[test]
    fn basic_operations() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");

        assert!(graph.ensure_node(&key("alice")).expect("ensure"));
        assert!(!graph.ensure_node(&key("alice")).expect("ensure"));

        graph
            .upsert_edges(
                &key("alice"),
                &follows(),
                &[(key("bob"), EdgeAttrs::new(3, None))],
            )
            .expect("upsert");
        assert_eq!(graph.node_count().expect("count"), 2);
        assert_eq!(graph.edge_count().expect("count"), 1);
    }

    #[test]
    fn range_scan_stops_at_prefix_boundary() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let attrs = EdgeAttrs::new(1, None);

        graph
            .upsert_edges(&key("alice"), &follows(), &[(key("bob"), attrs.clone())])
            .expect("upsert");
        graph
            .upsert_edges(
                &key("alice"),
                &EdgeType::new("MUTES"),
                &[(key("carol"), attrs.clone())],
            )
            .expect("upsert");
        graph
            .upsert_edges(&key("alicf"), &follows(), &[(key("dave"), attrs)])
            .expect("upsert");

        let targets = graph.edge_targets(&key("alice"), &follows()).expect("targets");
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec![key("bob")]);
    }

    #[test]
    fn apply_delta_is_one_commit() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let attrs = EdgeAttrs::new(1, None);
        graph
            .upsert_edges(
                &key("alice"),
                &follows(),
                &[(key("x"), attrs.clone()), (key("y"), attrs)],
            )
            .expect("seed");

        let checkpoint = Checkpoint::new(EventId::parse("e2").expect("id"), 2);
        graph
            .apply_delta(
                &key("alice"),
                Kind(3),
                &follows(),
                &[(key("z"), EdgeAttrs::new(2, None))],
                &[key("x")],
                Some(&checkpoint),
            )
            .expect("apply");

        let targets: Vec<_> = graph
            .edge_targets(&key("alice"), &follows())
            .expect("targets")
            .into_iter()
            .collect();
        assert_eq!(targets, vec![key("y"), key("z")]);
        assert_eq!(
            graph.checkpoint(&key("alice"), Kind(3)).expect("read"),
            Some(checkpoint)
        );
    }

    #[test]
    fn recovery_persistence_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("graph.redb");
        let checkpoint = Checkpoint::new(EventId::parse("e1").expect("id"), 10);

        {
            let mut graph = RedbGraph::open(&db_path).expect("open db");
            graph
                .apply_delta(
                    &key("alice"),
                    Kind(3),
                    &follows(),
                    &[(key("bob"), EdgeAttrs::new(10, None))],
                    &[],
                    Some(&checkpoint),
                )
                .expect("apply");
        }
        // Graph dropped here, simulating process exit

        {
            let graph = RedbGraph::open(&db_path).expect("reopen db");
            assert_eq!(graph.node_count().expect("count"), 2);
            assert_eq!(graph.edges().expect("edges").len(), 1);
            assert_eq!(
                graph.checkpoint(&key("alice"), Kind(3)).expect("read"),
                Some(checkpoint)
            );
            assert_eq!(
                graph.actors().expect("actors"),
                vec![key("alice"), key("bob")]
            );
        }
    }

    #[test]
    fn subtype_survives_roundtrip_through_store() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("graph.redb")).expect("open db");
        let reports = EdgeType::new("REPORTS");
        graph
            .upsert_edges(
                &key("alice"),
                &reports,
                &[(key("mallory"), EdgeAttrs::new(5, Some("spam".into())))],
            )
            .expect("upsert");

        let attrs = graph
            .edge(&key("alice"), &reports, &key("mallory"))
            .expect("edge")
            .unwrap();
        assert_eq!(attrs.subtype.as_deref(), Some("spam"));
    }
}
