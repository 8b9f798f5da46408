//! # Core Type Definitions
//!
//! This module contains the data model shared by every stage of the
//! reconciliation pipeline:
//! - Identifiers (`ActorKey`, `EventId`, `Kind`, `EdgeType`)
//! - Upstream records (`Event`)
//! - Graph-side state (`Checkpoint`, `EdgeAttrs`)
//! - Work markers (`QueueKey`)
//! - Error types (`SyncError`)
//!
//! ## Replaceable Ordering
//!
//! For a given `(actor, kind)` only one event is current: the one with the
//! greatest `created_at`. Two events sharing a `created_at` are ordered by
//! event id, lowest id wins. [`Checkpoint::supersedes`] is the single place
//! this rule lives; the event log, the reconciler and the bulk loader all
//! go through it.

use crate::primitives::{MAX_EVENT_ID_LENGTH, MAX_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Characters allowed in keys and ids.
///
/// Keys end up in file names (queue markers) and comma-separated bulk
/// tables, so separators, quotes and whitespace are rejected outright.
fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

fn validate_token(raw: &str, max_len: usize, what: &str) -> Result<(), SyncError> {
    if raw.is_empty() {
        return Err(SyncError::InvalidKey(format!("empty {what}")));
    }
    if raw.len() > max_len {
        return Err(SyncError::InvalidKey(format!(
            "{what} exceeds {max_len} bytes"
        )));
    }
    if !raw.chars().all(is_key_char) {
        return Err(SyncError::InvalidKey(format!(
            "{what} contains unsupported characters: {raw:?}"
        )));
    }
    Ok(())
}

/// Opaque identity of an actor (a node in the graph).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorKey(String);

impl ActorKey {
    /// Parse and validate an actor key.
    pub fn parse(raw: impl Into<String>) -> Result<Self, SyncError> {
        let raw = raw.into();
        validate_token(&raw, MAX_KEY_LENGTH, "actor key")?;
        Ok(Self(raw))
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActorKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ActorKey> for String {
    fn from(key: ActorKey) -> Self {
        key.0
    }
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an upstream event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    /// Parse and validate an event id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, SyncError> {
        let raw = raw.into();
        validate_token(&raw, MAX_EVENT_ID_LENGTH, "event id")?;
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric event kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Kind(pub u32);

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type label of a directed edge (e.g. `FOLLOWS`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeType(pub String);

impl EdgeType {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// An immutable upstream event.
///
/// Only the fields the pipeline needs are decoded; `content`, `sig` and any
/// other members of the wire object are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Author of the event. The wire name is `pubkey`; `actor` is accepted too.
    #[serde(rename = "pubkey", alias = "actor")]
    pub actor: ActorKey,
    pub kind: Kind,
    pub created_at: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
}

impl Event {
    /// The `(id, created_at)` pair of this event.
    #[must_use]
    pub fn head(&self) -> Checkpoint {
        Checkpoint::new(self.id.clone(), self.created_at)
    }

    /// The queue key this event triggers.
    #[must_use]
    pub fn key(&self) -> QueueKey {
        QueueKey::new(self.actor.clone(), self.kind)
    }
}

// =============================================================================
// CHECKPOINT
// =============================================================================

/// The event last reflected in the graph for an `(actor, kind)` pair.
///
/// Also used for upstream "heads" (latest id per kind) during sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub event_id: EventId,
    pub created_at: u64,
}

impl Checkpoint {
    #[must_use]
    pub fn new(event_id: EventId, created_at: u64) -> Self {
        Self {
            event_id,
            created_at,
        }
    }

    /// Whether `self` replaces `other` under replaceable-event semantics.
    ///
    /// Greater `created_at` wins; on a tie the lexicographically lowest
    /// event id wins. Identical heads never supersede each other.
    #[must_use]
    pub fn supersedes(&self, other: &Checkpoint) -> bool {
        match self.created_at.cmp(&other.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.event_id < other.event_id,
        }
    }
}

// =============================================================================
// EDGES
// =============================================================================

/// Attributes stored on a directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EdgeAttrs {
    /// `created_at` of the event that asserted the edge.
    pub created_at: u64,
    /// Optional tag-derived refinement of the edge type (e.g. report reason).
    pub subtype: Option<String>,
}

impl EdgeAttrs {
    #[must_use]
    pub fn new(created_at: u64, subtype: Option<String>) -> Self {
        Self {
            created_at,
            subtype,
        }
    }
}

// =============================================================================
// QUEUE KEY
// =============================================================================

/// Key of a pending work marker: one per `(actor, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub actor: ActorKey,
    pub kind: Kind,
}

impl QueueKey {
    #[must_use]
    pub fn new(actor: ActorKey, kind: Kind) -> Self {
        Self { actor, kind }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.actor, self.kind)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by the reconciliation pipeline.
///
/// Retry semantics follow the variant: see [`SyncError::is_retryable`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// The event source or graph store is unavailable.
    #[error("Transient I/O error: {0}")]
    Transient(String),

    /// An upstream record could not be parsed or validated.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// A queued key has no current event upstream.
    #[error("No current event for {actor} kind {kind}")]
    MissingAuthoritativeEvent { actor: ActorKey, kind: Kind },

    /// A queue marker could not be read back.
    #[error("Corrupt queue marker {path}: {reason}")]
    QueueCorruption { path: String, reason: String },

    /// A graph store write failed part-way through an apply.
    #[error("Store write failed: {0}")]
    StoreWrite(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A key or id failed validation.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The event kind has no relation mapping.
    #[error("Unknown relation kind: {0}")]
    UnknownKind(Kind),

    /// A filesystem error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether leaving the queue item in place and retrying later can help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::StoreWrite(_) | Self::Io(_) | Self::Serialization(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn head(id: &str, at: u64) -> Checkpoint {
        Checkpoint::new(EventId::parse(id).expect("id"), at)
    }

    #[test]
    fn actor_key_rejects_separators() {
        assert!(ActorKey::parse("abc,def").is_err());
        assert!(ActorKey::parse("abc def").is_err());
        assert!(ActorKey::parse("").is_err());
        assert!(ActorKey::parse("a".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(ActorKey::parse("npub_1-a.b").is_ok());
    }

    #[test]
    fn newer_created_at_supersedes() {
        assert!(head("bb", 20).supersedes(&head("aa", 10)));
        assert!(!head("aa", 10).supersedes(&head("bb", 20)));
    }

    #[test]
    fn tie_breaks_on_lowest_id() {
        assert!(head("aa", 10).supersedes(&head("bb", 10)));
        assert!(!head("bb", 10).supersedes(&head("aa", 10)));
        assert!(!head("aa", 10).supersedes(&head("aa", 10)));
    }

    #[test]
    fn event_decodes_wire_shape() {
        let raw = r#"{"id":"e1","pubkey":"alice","kind":3,"created_at":5,
            "tags":[["p","bob"]],"content":"","sig":"00"}"#;
        let event: Event = serde_json::from_str(raw).expect("decode");
        assert_eq!(event.actor.as_str(), "alice");
        assert_eq!(event.kind, Kind(3));
        assert_eq!(event.key().to_string(), "alice.3");
    }

    #[test]
    fn event_rejects_invalid_actor() {
        let raw = r#"{"id":"e1","pubkey":"a,b","kind":3,"created_at":5,"tags":[]}"#;
        assert!(serde_json::from_str::<Event>(raw).is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Transient("down".into()).is_retryable());
        assert!(SyncError::StoreWrite("disk".into()).is_retryable());
        assert!(!SyncError::MalformedEvent("bad".into()).is_retryable());
        assert!(!SyncError::UnknownKind(Kind(7)).is_retryable());
    }
}
