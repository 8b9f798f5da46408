//! Bulk loader: applies extracted tables to a graph store.
//!
//! The export may hold several events per `(actor, kind)`. The event table
//! decides which one is current (same tie-break as everywhere else), and only
//! relationship rows carrying that event id are applied. Each current event is
//! then applied as an edge delta with checkpoint advance, the same unit of
//! work the incremental engine performs, so loading into a non-empty graph is
//! safe and a graph checkpoint newer than the export is left alone.

use super::worker::EdgeRow;
use super::writer::{EVENTS_HEADER, NODES_HEADER, RELATIONSHIPS_HEADER};
use crate::graph::GraphStore;
use crate::primitives::{EVENTS_FILE, NODES_FILE, RELATIONSHIPS_FILE};
use crate::reconcile::compute_delta;
use crate::relation::RelationRegistry;
use crate::{ActorKey, Checkpoint, EdgeAttrs, EdgeType, EventId, Kind, QueueKey, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Counters of one load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub nodes: u64,
    pub event_rows: u64,
    pub current_events: u64,
    pub edge_rows: u64,
    /// Rows that did not parse or named an unmapped edge type.
    pub skipped_rows: u64,
    pub applied: u64,
    pub converged: u64,
    pub stale: u64,
    pub edges_added: u64,
    pub edges_removed: u64,
}

/// Load the tables in `dir` into `graph`.
pub fn load_tables<G: GraphStore + ?Sized>(
    graph: &mut G,
    registry: &RelationRegistry,
    dir: &Path,
) -> Result<LoadReport, SyncError> {
    let mut report = LoadReport::default();

    let mut current: BTreeMap<QueueKey, Checkpoint> = BTreeMap::new();
    for line in open_table(dir, EVENTS_FILE, EVENTS_HEADER)? {
        let line = line?;
        report.event_rows += 1;
        let Some((key, head)) = parse_event_row(&line) else {
            report.skipped_rows += 1;
            tracing::warn!(row = %line, "skipping unreadable event row");
            continue;
        };
        match current.get(&key) {
            Some(existing) if !head.supersedes(existing) => {}
            _ => {
                current.insert(key, head);
            }
        }
    }
    report.current_events = current.len() as u64;

    for line in open_table(dir, NODES_FILE, NODES_HEADER)? {
        let line = line?;
        match ActorKey::parse(line.trim()) {
            Ok(actor) => {
                graph.ensure_node(&actor)?;
                report.nodes += 1;
            }
            Err(e) => {
                report.skipped_rows += 1;
                tracing::warn!(row = %line, error = %e, "skipping unreadable node row");
            }
        }
    }

    // Rows of one event are contiguous: a worker emits them together.
    let mut group: Option<(QueueKey, EventId, EdgeType)> = None;
    let mut targets: BTreeMap<ActorKey, EdgeAttrs> = BTreeMap::new();
    for line in open_table(dir, RELATIONSHIPS_FILE, RELATIONSHIPS_HEADER)? {
        let line = line?;
        report.edge_rows += 1;
        let Some(row) = parse_edge_row(&line) else {
            report.skipped_rows += 1;
            tracing::warn!(row = %line, "skipping unreadable relationship row");
            continue;
        };
        let Some(relation) = registry.by_edge_type(&row.edge_type) else {
            report.skipped_rows += 1;
            tracing::debug!(edge_type = %row.edge_type, "skipping row of unmapped edge type");
            continue;
        };
        let key = QueueKey::new(row.source, relation.kind);
        let same_group = group
            .as_ref()
            .is_some_and(|(k, id, _)| *k == key && *id == row.event_id);
        if !same_group {
            if let Some((key, id, edge_type)) = group.take() {
                flush_group(graph, &mut current, &key, &id, &edge_type, &mut targets, &mut report)?;
            }
            group = Some((key, row.event_id, row.edge_type));
        }
        let created_at = group
            .as_ref()
            .and_then(|(k, _, _)| current.get(k))
            .map(|head| head.created_at)
            .unwrap_or(0);
        targets
            .entry(row.target)
            .or_insert_with(|| EdgeAttrs::new(created_at, row.subtype));
    }
    if let Some((key, id, edge_type)) = group.take() {
        flush_group(graph, &mut current, &key, &id, &edge_type, &mut targets, &mut report)?;
    }

    // Current events without a single target row assert nothing.
    let remaining = std::mem::take(&mut current);
    for (key, head) in remaining {
        let Ok(relation) = registry.get(key.kind) else {
            report.skipped_rows += 1;
            continue;
        };
        apply_current(
            graph,
            &key,
            &relation.edge_type,
            &head,
            &BTreeMap::new(),
            &mut report,
        )?;
    }

    tracing::info!(
        nodes = report.nodes,
        current_events = report.current_events,
        applied = report.applied,
        edges_added = report.edges_added,
        edges_removed = report.edges_removed,
        skipped_rows = report.skipped_rows,
        "bulk load finished"
    );
    Ok(report)
}

fn flush_group<G: GraphStore + ?Sized>(
    graph: &mut G,
    current: &mut BTreeMap<QueueKey, Checkpoint>,
    key: &QueueKey,
    event_id: &EventId,
    edge_type: &EdgeType,
    targets: &mut BTreeMap<ActorKey, EdgeAttrs>,
    report: &mut LoadReport,
) -> Result<(), SyncError> {
    let targets = std::mem::take(targets);
    // Rows of a superseded event, or a duplicate of an event already applied.
    if current.get(key).is_none_or(|head| head.event_id != *event_id) {
        return Ok(());
    }
    if let Some(head) = current.remove(key) {
        apply_current(graph, key, edge_type, &head, &targets, report)?;
    }
    Ok(())
}

fn apply_current<G: GraphStore + ?Sized>(
    graph: &mut G,
    key: &QueueKey,
    edge_type: &EdgeType,
    head: &Checkpoint,
    targets: &BTreeMap<ActorKey, EdgeAttrs>,
    report: &mut LoadReport,
) -> Result<(), SyncError> {
    if let Some(checkpoint) = graph.checkpoint(&key.actor, key.kind)? {
        if checkpoint.event_id == head.event_id {
            report.converged += 1;
            return Ok(());
        }
        if !head.supersedes(&checkpoint) {
            report.stale += 1;
            return Ok(());
        }
    }
    let existing = graph.edge_targets(&key.actor, edge_type)?;
    let delta = compute_delta(targets, &existing);
    graph.apply_delta(
        &key.actor,
        key.kind,
        edge_type,
        &delta.to_add,
        &delta.to_remove,
        Some(head),
    )?;
    report.applied += 1;
    report.edges_added += delta.to_add.len() as u64;
    report.edges_removed += delta.to_remove.len() as u64;
    Ok(())
}

fn open_table(
    dir: &Path,
    name: &str,
    header: &str,
) -> Result<Lines<BufReader<File>>, SyncError> {
    let mut lines = BufReader::new(File::open(dir.join(name))?).lines();
    match lines.next().transpose()? {
        Some(first) if first.trim_end() == header => Ok(lines),
        other => Err(SyncError::Serialization(format!(
            "{name}: expected header {header:?}, found {:?}",
            other.unwrap_or_default()
        ))),
    }
}

fn parse_event_row(line: &str) -> Option<(QueueKey, Checkpoint)> {
    let mut fields = line.trim_end().split(',');
    let actor = ActorKey::parse(fields.next()?).ok()?;
    let event_id = EventId::parse(fields.next()?).ok()?;
    let created_at = fields.next()?.parse().ok()?;
    let kind = Kind(fields.next()?.parse().ok()?);
    if fields.next().is_some() {
        return None;
    }
    Some((QueueKey::new(actor, kind), Checkpoint::new(event_id, created_at)))
}

fn parse_edge_row(line: &str) -> Option<EdgeRow> {
    let mut fields = line.trim_end_matches(['\r', '\n']).splitn(5, ',');
    let source = ActorKey::parse(fields.next()?).ok()?;
    let target = ActorKey::parse(fields.next()?).ok()?;
    let edge_type = EdgeType::new(fields.next()?);
    let event_id = EventId::parse(fields.next()?).ok()?;
    let subtype = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
    Some(EdgeRow {
        source,
        target,
        edge_type,
        event_id,
        subtype,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use std::fs;
    use tempfile::tempdir;

    fn write_tables(dir: &Path, nodes: &[&str], edges: &[&str], events: &[&str]) {
        let table = |header: &str, rows: &[&str]| {
            let mut text = format!("{header}\n");
            for row in rows {
                text.push_str(row);
                text.push('\n');
            }
            text
        };
        fs::write(dir.join(NODES_FILE), table(NODES_HEADER, nodes)).expect("nodes");
        fs::write(dir.join(RELATIONSHIPS_FILE), table(RELATIONSHIPS_HEADER, edges))
            .expect("edges");
        fs::write(dir.join(EVENTS_FILE), table(EVENTS_HEADER, events)).expect("events");
    }

    fn key(s: &str) -> ActorKey {
        ActorKey::parse(s).expect("key")
    }

    #[test]
    fn only_current_event_rows_are_applied() {
        let temp = tempdir().expect("temp dir");
        write_tables(
            temp.path(),
            &["alice"],
            &[
                "alice,bob,FOLLOWS,e1,",
                "alice,carol,FOLLOWS,e2,",
                "alice,carol,FOLLOWS,e2,",
                "alice,dave,FOLLOWS,e2,",
            ],
            &["alice,e1,10,3", "alice,e2,20,3"],
        );

        let mut graph = MemoryGraph::new();
        let report = load_tables(&mut graph, &RelationRegistry::default(), temp.path())
            .expect("load");

        let targets = graph
            .edge_targets(&key("alice"), &EdgeType::new("FOLLOWS"))
            .expect("targets");
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec![key("carol"), key("dave")]);
        assert_eq!(report.current_events, 1);
        assert_eq!(report.edges_added, 2);
        let checkpoint = graph.checkpoint(&key("alice"), Kind(3)).expect("read");
        assert_eq!(checkpoint.map(|c| c.created_at), Some(20));
    }

    #[test]
    fn event_without_rows_revokes_and_subtype_survives() {
        let temp = tempdir().expect("temp dir");
        write_tables(
            temp.path(),
            &["alice"],
            &["alice,mallory,REPORTS,r1,spam, really"],
            &["alice,r1,5,1984", "alice,m1,7,10000"],
        );
        let mut graph = MemoryGraph::new();
        graph
            .upsert_edges(&key("alice"), &EdgeType::new("MUTES"), &[(key("bob"), EdgeAttrs::new(1, None))])
            .expect("seed");

        load_tables(&mut graph, &RelationRegistry::default(), temp.path()).expect("load");

        assert!(graph
            .edge_targets(&key("alice"), &EdgeType::new("MUTES"))
            .expect("targets")
            .is_empty());
        let report = graph
            .edge(&key("alice"), &EdgeType::new("REPORTS"), &key("mallory"))
            .expect("edge")
            .expect("present");
        assert_eq!(report.subtype.as_deref(), Some("spam, really"));
    }

    #[test]
    fn newer_graph_checkpoint_is_kept() {
        let temp = tempdir().expect("temp dir");
        write_tables(temp.path(), &["alice"], &["alice,bob,FOLLOWS,e1,"], &["alice,e1,10,3"]);
        let mut graph = MemoryGraph::new();
        graph
            .set_checkpoint(
                &key("alice"),
                Kind(3),
                &Checkpoint::new(EventId::parse("e9").expect("id"), 90),
            )
            .expect("seed");

        let report = load_tables(&mut graph, &RelationRegistry::default(), temp.path())
            .expect("load");
        assert_eq!(report.stale, 1);
        assert_eq!(graph.edge_count().expect("count"), 0);
    }

    #[test]
    fn wrong_header_is_rejected() {
        let temp = tempdir().expect("temp dir");
        write_tables(temp.path(), &[], &[], &[]);
        fs::write(temp.path().join(EVENTS_FILE), "id,kind\n").expect("write");
        let mut graph = MemoryGraph::new();
        assert!(matches!(
            load_tables(&mut graph, &RelationRegistry::default(), temp.path()),
            Err(SyncError::Serialization(_))
        ));
    }
}
