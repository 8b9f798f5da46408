//! # Relation Kinds
//!
//! Static mapping from an event kind to the edge type its tags assert.
//!
//! Each watched kind names the tag that carries targets (`p` for the
//! defaults) and optionally the tag element that refines the edge type,
//! e.g. the reason string of a report.

use crate::{ActorKey, EdgeAttrs, EdgeType, Event, Kind, SyncError};
use crate::primitives::MAX_TAGS_PER_EVENT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping of one event kind to an edge type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationKind {
    pub kind: Kind,
    pub edge_type: EdgeType,
    /// First tag element that marks a target-bearing tag.
    #[serde(default = "default_target_tag")]
    pub target_tag: String,
    /// Index of the tag element holding the subtype, if any.
    #[serde(default)]
    pub subtype_index: Option<usize>,
}

fn default_target_tag() -> String {
    "p".to_string()
}

impl RelationKind {
    #[must_use]
    pub fn new(kind: u32, edge_type: &str) -> Self {
        Self {
            kind: Kind(kind),
            edge_type: EdgeType::new(edge_type),
            target_tag: default_target_tag(),
            subtype_index: None,
        }
    }

    #[must_use]
    pub fn with_subtype_index(mut self, index: usize) -> Self {
        self.subtype_index = Some(index);
        self
    }

    /// Every target occurrence in tag order, duplicates preserved.
    ///
    /// Tags with an invalid target value are skipped.
    pub fn target_occurrences<'a>(
        &'a self,
        event: &'a Event,
    ) -> impl Iterator<Item = (ActorKey, Option<String>)> + 'a {
        event
            .tags
            .iter()
            .take(MAX_TAGS_PER_EVENT)
            .filter(|tag| tag.first().is_some_and(|name| *name == self.target_tag))
            .filter_map(|tag| {
                let target = ActorKey::parse(tag.get(1)?.as_str()).ok()?;
                let subtype = self
                    .subtype_index
                    .and_then(|i| tag.get(i))
                    .filter(|s| !s.is_empty())
                    .cloned();
                Some((target, subtype))
            })
    }

    /// Deduplicated target set of an event with the attributes each edge
    /// should carry. The first occurrence of a target decides its subtype.
    #[must_use]
    pub fn targets(&self, event: &Event) -> BTreeMap<ActorKey, EdgeAttrs> {
        let mut targets = BTreeMap::new();
        for (target, subtype) in self.target_occurrences(event) {
            targets
                .entry(target)
                .or_insert_with(|| EdgeAttrs::new(event.created_at, subtype));
        }
        targets
    }
}

/// The set of watched kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRegistry {
    kinds: BTreeMap<Kind, RelationKind>,
}

impl Default for RelationRegistry {
    /// Follow lists, mute lists and reports.
    fn default() -> Self {
        Self {
            kinds: [
                RelationKind::new(3, "FOLLOWS"),
                RelationKind::new(10000, "MUTES"),
                RelationKind::new(1984, "REPORTS").with_subtype_index(2),
            ]
            .into_iter()
            .map(|r| (r.kind, r))
            .collect(),
        }
    }
}

impl RelationRegistry {
    /// Build a registry, rejecting duplicate kinds and duplicate edge types.
    ///
    /// Edge types are written verbatim into bulk tables, so they are limited
    /// to ASCII letters, digits and `_`.
    pub fn new(relations: Vec<RelationKind>) -> Result<Self, SyncError> {
        let mut kinds = BTreeMap::new();
        for relation in relations {
            if relation.target_tag.is_empty() {
                return Err(SyncError::Config(format!(
                    "kind {} has an empty target tag",
                    relation.kind
                )));
            }
            if relation.edge_type.as_str().is_empty()
                || !relation
                    .edge_type
                    .as_str()
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(SyncError::Config(format!(
                    "edge type {:?} must be non-empty [A-Za-z0-9_]",
                    relation.edge_type.as_str()
                )));
            }
            if kinds
                .values()
                .any(|r: &RelationKind| r.edge_type == relation.edge_type)
            {
                return Err(SyncError::Config(format!(
                    "edge type {} mapped twice",
                    relation.edge_type
                )));
            }
            if kinds.insert(relation.kind, relation.clone()).is_some() {
                return Err(SyncError::Config(format!(
                    "kind {} mapped twice",
                    relation.kind
                )));
            }
        }
        if kinds.is_empty() {
            return Err(SyncError::Config("no relation kinds configured".into()));
        }
        Ok(Self { kinds })
    }

    pub fn get(&self, kind: Kind) -> Result<&RelationKind, SyncError> {
        self.kinds.get(&kind).ok_or(SyncError::UnknownKind(kind))
    }

    /// Reverse lookup used by the bulk loader.
    #[must_use]
    pub fn by_edge_type(&self, edge_type: &EdgeType) -> Option<&RelationKind> {
        self.kinds.values().find(|r| r.edge_type == *edge_type)
    }

    #[must_use]
    pub fn is_watched(&self, kind: Kind) -> bool {
        self.kinds.contains_key(&kind)
    }

    /// Watched kinds in ascending order.
    #[must_use]
    pub fn watched_kinds(&self) -> Vec<Kind> {
        self.kinds.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelationKind> {
        self.kinds.values()
    }
}

// =============================================================================
// TESTS
// =============================================================================
