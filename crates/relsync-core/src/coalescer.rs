//! # Ingestion Coalescer
//!
//! Turns a live event stream into queue markers. Each watched event
//! overwrites the single marker of its `(actor, kind)`; tags are discarded
//! because the engine re-fetches the current event when it processes the
//! key. A burst of N updates for one key therefore leaves one marker.
//!
//! A failed marker write is logged and dropped. The comparison sweep picks
//! the key up later.

use crate::ingestor::Ingestor;
use crate::queue::RetryQueue;
use crate::relation::RelationRegistry;
use crate::{Event, QueueKey};
use serde::{Deserialize, Serialize};

/// What happened to one observed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Marker written (or overwritten) for the key.
    Enqueued(QueueKey),
    /// Kind not watched, or the line did not decode.
    Ignored,
    /// Marker write failed; left to the sweep.
    Dropped(QueueKey),
}

/// Counters of a coalescer since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerStats {
    pub observed: u64,
    pub enqueued: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub dropped: u64,
}

/// Live-feed front end of the retry queue.
pub struct Coalescer<Q: RetryQueue> {
    queue: Q,
    registry: RelationRegistry,
    stats: CoalescerStats,
}

impl<Q: RetryQueue> Coalescer<Q> {
    pub fn new(queue: Q, registry: RelationRegistry) -> Self {
        Self {
            queue,
            registry,
            stats: CoalescerStats::default(),
        }
    }

    /// Handle one decoded event.
    pub fn observe(&mut self, event: &Event) -> Observation {
        self.stats.observed += 1;
        if !self.registry.is_watched(event.kind) {
            self.stats.ignored += 1;
            return Observation::Ignored;
        }
        let key = event.key();
        match self.queue.enqueue_or_replace(&key) {
            Ok(_) => {
                self.stats.enqueued += 1;
                tracing::trace!(key = %key, event = %event.id, "marker written");
                Observation::Enqueued(key)
            }
            Err(e) => {
                self.stats.dropped += 1;
                tracing::warn!(key = %key, error = %e, "marker write failed; dropping, sweep will recover");
                Observation::Dropped(key)
            }
        }
    }

    /// Handle one raw NDJSON line of the live feed.
    pub fn observe_line(&mut self, line: &[u8]) -> Observation {
        match Ingestor::parse_line(line) {
            Ok(event) => self.observe(&event),
            Err(e) => {
                self.stats.observed += 1;
                self.stats.malformed += 1;
                tracing::debug!(error = %e, "skipping malformed feed line");
                Observation::Ignored
            }
        }
    }

    /// Count a feed line discarded before parsing (over the length limit).
    pub fn reject_line(&mut self) {
        self.stats.observed += 1;
        self.stats.malformed += 1;
        tracing::debug!("skipping oversized feed line");
    }

    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        self.stats
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }
}

// =============================================================================
// TESTS
// =============================================================================
