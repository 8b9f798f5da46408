//! Chunk processing: a pure function from raw lines to table rows.

use crate::ingestor::Ingestor;
use crate::relation::RelationRegistry;
use crate::{ActorKey, EdgeType, EventId, Kind, SyncError};

/// A contiguous slice of the export handed to one worker.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Dispatch order, starting at 0.
    pub index: usize,
    /// Non-blank lines, already trimmed.
    pub lines: Vec<Vec<u8>>,
}

/// One row of `events.csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub actor: ActorKey,
    pub event_id: EventId,
    pub created_at: u64,
    pub kind: Kind,
}

/// One row of `relationships.csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRow {
    pub source: ActorKey,
    pub target: ActorKey,
    pub edge_type: EdgeType,
    pub event_id: EventId,
    pub subtype: Option<String>,
}

/// Everything a worker extracted from one chunk, sent back as one message.
#[derive(Debug, Clone, Default)]
pub struct ChunkResult {
    pub index: usize,
    /// Lines in the chunk, valid or not.
    pub lines: u64,
    pub malformed: u64,
    /// Valid events of kinds nobody watches.
    pub unwatched: u64,
    /// Author of each watched event, in line order (not deduplicated).
    pub actors: Vec<ActorKey>,
    pub events: Vec<EventRow>,
    pub edges: Vec<EdgeRow>,
}

/// Default chunk processor.
///
/// Malformed lines are counted and skipped. Every target-bearing tag yields
/// one edge row; repeated tags within an event are kept.
pub fn extract_chunk(registry: &RelationRegistry, chunk: Chunk) -> Result<ChunkResult, SyncError> {
    let mut result = ChunkResult {
        index: chunk.index,
        lines: chunk.lines.len() as u64,
        ..ChunkResult::default()
    };
    for line in &chunk.lines {
        let event = match Ingestor::parse_line(line) {
            Ok(event) => event,
            Err(e) => {
                result.malformed += 1;
                tracing::trace!(chunk = chunk.index, error = %e, "malformed export line");
                continue;
            }
        };
        let Ok(relation) = registry.get(event.kind) else {
            result.unwatched += 1;
            continue;
        };
        for (target, subtype) in relation.target_occurrences(&event) {
            result.edges.push(EdgeRow {
                source: event.actor.clone(),
                target,
                edge_type: relation.edge_type.clone(),
                event_id: event.id.clone(),
                subtype: subtype.map(|s| sanitize_field(&s)),
            });
        }
        result.actors.push(event.actor.clone());
        result.events.push(EventRow {
            actor: event.actor,
            event_id: event.id,
            created_at: event.created_at,
            kind: event.kind,
        });
    }
    Ok(result)
}

/// Free text goes into the last CSV column; only line breaks must go.
fn sanitize_field(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(lines: &[&str]) -> Chunk {
        Chunk {
            index: 0,
            lines: lines.iter().map(|l| l.as_bytes().to_vec()).collect(),
        }
    }

    #[test]
    fn duplicate_tags_are_preserved() {
        let result = extract_chunk(
            &RelationRegistry::default(),
            chunk(&[
                r#"{"id":"e1","pubkey":"alice","kind":3,"created_at":1,"tags":[["p","bob"],["p","bob"],["e","x"]]}"#,
            ]),
        )
        .expect("extract");

        assert_eq!(result.edges.len(), 2);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.actors.len(), 1);
    }

    #[test]
    fn malformed_and_unwatched_lines_are_counted() {
        let result = extract_chunk(
            &RelationRegistry::default(),
            chunk(&[
                "{broken",
                r#"{"id":"n1","pubkey":"alice","kind":1,"created_at":1,"tags":[]}"#,
                r#"{"id":"e1","pubkey":"alice","kind":3,"created_at":1,"tags":[]}"#,
            ]),
        )
        .expect("extract");

        assert_eq!(result.lines, 3);
        assert_eq!(result.malformed, 1);
        assert_eq!(result.unwatched, 1);
        assert_eq!(result.events.len(), 1);
        assert!(result.edges.is_empty());
    }

    #[test]
    fn report_reason_is_kept_and_sanitized() {
        let result = extract_chunk(
            &RelationRegistry::default(),
            chunk(&[
                r#"{"id":"r1","pubkey":"alice","kind":1984,"created_at":1,"tags":[["p","mallory","spam\nmore"]]}"#,
            ]),
        )
        .expect("extract");

        assert_eq!(result.edges[0].subtype.as_deref(), Some("spam more"));
    }
}
