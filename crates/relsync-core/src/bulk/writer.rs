//! Output side of the bulk extractor: the three normalized tables.
//!
//! Keys, ids and edge types are validated to exclude separators, so rows are
//! written without quoting. The optional subtype is free text and always the
//! last column of `relationships.csv`; readers split at most four times.

use super::worker::ChunkResult;
use crate::primitives::{EVENTS_FILE, NODES_FILE, RELATIONSHIPS_FILE};
use crate::{ActorKey, SyncError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub(crate) const NODES_HEADER: &str = "actor";
pub(crate) const RELATIONSHIPS_HEADER: &str = "source,target,type,event_id,subtype";
pub(crate) const EVENTS_HEADER: &str = "actor,event_id,created_at,kind";

/// Buffered writers for one run directory. Only the coordinator holds one.
pub(crate) struct TableWriter {
    nodes: BufWriter<File>,
    relationships: BufWriter<File>,
    events: BufWriter<File>,
}

fn create(dir: &Path, name: &str, header: &str) -> Result<BufWriter<File>, SyncError> {
    let mut writer = BufWriter::new(File::create(dir.join(name))?);
    writeln!(writer, "{header}")?;
    Ok(writer)
}

impl TableWriter {
    pub(crate) fn create(dir: &Path) -> Result<Self, SyncError> {
        Ok(Self {
            nodes: create(dir, NODES_FILE, NODES_HEADER)?,
            relationships: create(dir, RELATIONSHIPS_FILE, RELATIONSHIPS_HEADER)?,
            events: create(dir, EVENTS_FILE, EVENTS_HEADER)?,
        })
    }

    /// Append the edge and event rows of one chunk.
    pub(crate) fn append(&mut self, result: &ChunkResult) -> Result<(), SyncError> {
        for edge in &result.edges {
            writeln!(
                self.relationships,
                "{},{},{},{},{}",
                edge.source,
                edge.target,
                edge.edge_type,
                edge.event_id,
                edge.subtype.as_deref().unwrap_or("")
            )?;
        }
        for event in &result.events {
            writeln!(
                self.events,
                "{},{},{},{}",
                event.actor, event.event_id, event.created_at, event.kind
            )?;
        }
        Ok(())
    }

    /// Write the node table and flush everything.
    pub(crate) fn finish<'a>(
        mut self,
        actors: impl IntoIterator<Item = &'a ActorKey>,
    ) -> Result<(), SyncError> {
        for actor in actors {
            writeln!(self.nodes, "{actor}")?;
        }
        for writer in [&mut self.nodes, &mut self.relationships, &mut self.events] {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}
