//! # Replaceable Event Log
//!
//! In-memory index of the current event per `(actor, kind)`.
//!
//! Backs the file event source (an NDJSON export loaded into memory) and the
//! test suites. Insertion applies replaceable semantics through
//! [`Checkpoint::supersedes`], so the order events arrive in never matters.

use crate::ingestor::{Ingestor, LineStats};
use crate::{ActorKey, Checkpoint, Event, Kind, QueueKey, SyncError};
use std::collections::BTreeMap;
use std::io::BufRead;

/// Current events keyed by `(actor, kind)`.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    current: BTreeMap<QueueKey, Event>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an NDJSON export, skipping malformed lines.
    pub fn from_ndjson<R: BufRead>(reader: R) -> Result<(Self, LineStats), SyncError> {
        let mut log = Self::new();
        let stats = Ingestor::read_events(reader, |event| {
            log.insert(event);
        })?;
        Ok((log, stats))
    }

    /// Record an event. Returns `true` if it became the current event.
    pub fn insert(&mut self, event: Event) -> bool {
        let key = event.key();
        match self.current.get(&key) {
            Some(existing) if !event.head().supersedes(&existing.head()) => false,
            _ => {
                self.current.insert(key, event);
                true
            }
        }
    }

    /// Drop the current event of a key (deleted upstream).
    pub fn remove(&mut self, key: &QueueKey) -> Option<Event> {
        self.current.remove(key)
    }

    #[must_use]
    pub fn latest(&self, key: &QueueKey) -> Option<&Event> {
        self.current.get(key)
    }

    /// Heads of every current event authored by `actors` in `kinds`.
    #[must_use]
    pub fn heads(&self, actors: &[ActorKey], kinds: &[Kind]) -> Vec<(QueueKey, Checkpoint)> {
        let mut heads = Vec::new();
        for actor in actors {
            for kind in kinds {
                let key = QueueKey::new(actor.clone(), *kind);
                if let Some(event) = self.current.get(&key) {
                    heads.push((key, event.head()));
                }
            }
        }
        heads
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.current.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

/// Pick the current event out of a set of candidates, e.g. the lines of a
/// most-recent-first query response whose ordering is not trusted.
#[must_use]
pub fn newest(events: impl IntoIterator<Item = Event>) -> Option<Event> {
    events.into_iter().fold(None, |best: Option<Event>, event| match best {
        Some(b) if !event.head().supersedes(&b.head()) => Some(b),
        _ => Some(event),
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventId;

    fn event(id: &str, actor: &str, at: u64) -> Event {
        Event {
            id: EventId::parse(id).expect("id"),
            actor: ActorKey::parse(actor).expect("actor"),
            kind: Kind(3),
            created_at: at,
            tags: Vec::new(),
        }
    }

    #[test]
    fn insert_keeps_newest() {
        let mut log = EventLog::new();
        assert!(log.insert(event("e2", "alice", 20)));
        assert!(!log.insert(event("e1", "alice", 10)));
        assert!(log.insert(event("e3", "alice", 30)));

        let key = QueueKey::new(ActorKey::parse("alice").expect("key"), Kind(3));
        assert_eq!(log.latest(&key).map(|e| e.id.as_str()), Some("e3"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn insert_order_does_not_matter_on_ties() {
        let mut forward = EventLog::new();
        forward.insert(event("bb", "alice", 10));
        forward.insert(event("aa", "alice", 10));

        let mut backward = EventLog::new();
        backward.insert(event("aa", "alice", 10));
        backward.insert(event("bb", "alice", 10));

        let key = QueueKey::new(ActorKey::parse("alice").expect("key"), Kind(3));
        assert_eq!(forward.latest(&key).map(|e| e.id.as_str()), Some("aa"));
        assert_eq!(backward.latest(&key).map(|e| e.id.as_str()), Some("aa"));
    }

    #[test]
    fn newest_ignores_response_order() {
        let picked = newest(vec![
            event("e1", "alice", 10),
            event("e3", "alice", 30),
            event("e2", "alice", 20),
        ]);
        assert_eq!(picked.map(|e| e.id.to_string()), Some("e3".to_string()));
        assert!(newest(Vec::new()).is_none());
    }

    #[test]
    fn heads_cover_requested_actors_only() {
        let mut log = EventLog::new();
        log.insert(event("e1", "alice", 10));
        log.insert(event("e2", "bob", 10));

        let actors = vec![ActorKey::parse("alice").expect("key")];
        let heads = log.heads(&actors, &[Kind(3), Kind(10000)]);
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].1.event_id.as_str(), "e1");
    }
}
