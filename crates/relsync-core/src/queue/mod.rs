//! # Durable Retry Queue
//!
//! A durable key-set of pending work markers, one per `(actor, kind)`.
//!
//! The marker is a trigger, not a data carrier: it records only which key
//! changed. Whoever processes it re-fetches the authoritative latest event,
//! so overwriting a marker loses nothing. This is the coalescing point of
//! the pipeline.
//!
//! ## Crash-only contract
//!
//! A queue keeps no in-memory state. After a restart `list_pending()` alone
//! tells the consumer what is left to do, and a marker is removed only by
//! `ack()` after a fully successful apply.
//!
//! Backends:
//! - [`DirQueue`]: one JSON file per key
//! - [`crate::storage::RedbQueue`]: one redb row per key

mod dir;

pub use dir::DirQueue;

use crate::{QueueKey, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// A pending work marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(flatten)]
    pub key: QueueKey,
    /// Unix time of the last enqueue, in nanoseconds. Doubles as the marker
    /// generation checked by `ack`.
    pub enqueued_at: u64,
    /// Failed processing attempts since the last enqueue.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueItem {
    /// A fresh marker stamped with the current time.
    #[must_use]
    pub fn new(key: QueueKey) -> Self {
        Self {
            key,
            enqueued_at: now_nanos(),
            attempts: 0,
        }
    }

    /// Age of the marker in whole seconds at `now` (unix nanoseconds).
    #[must_use]
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.enqueued_at) / 1_000_000_000
    }
}

/// Current unix time in nanoseconds.
#[must_use]
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// =============================================================================
// RETRY QUEUE TRAIT
// =============================================================================

/// Durable set of pending keys.
pub trait RetryQueue: Send + Sync {
    /// Create or overwrite the single marker for `key`.
    fn enqueue_or_replace(&self, key: &QueueKey) -> Result<QueueItem, SyncError>;

    /// All readable markers, oldest first. Unreadable markers are moved to
    /// quarantine and skipped.
    fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError>;

    /// Remove the marker after a successful apply.
    ///
    /// If the marker was replaced since `item` was listed (a newer enqueue
    /// arrived mid-apply) it is kept, so the newer trigger is not lost.
    /// Returns `true` if a marker was removed.
    fn ack(&self, item: &QueueItem) -> Result<bool, SyncError>;

    /// Count a failed attempt on the marker. Returns the new attempt count,
    /// or 0 if the marker no longer exists.
    fn record_failure(&self, item: &QueueItem) -> Result<u32, SyncError>;

    /// Number of pending markers.
    fn len(&self) -> Result<usize, SyncError>;

    fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }
}

impl<Q: RetryQueue + ?Sized> RetryQueue for &Q {
    fn enqueue_or_replace(&self, key: &QueueKey) -> Result<QueueItem, SyncError> {
        (**self).enqueue_or_replace(key)
    }

    fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        (**self).list_pending()
    }

    fn ack(&self, item: &QueueItem) -> Result<bool, SyncError> {
        (**self).ack(item)
    }

    fn record_failure(&self, item: &QueueItem) -> Result<u32, SyncError> {
        (**self).record_failure(item)
    }

    fn len(&self) -> Result<usize, SyncError> {
        (**self).len()
    }
}

impl<Q: RetryQueue + ?Sized> RetryQueue for Arc<Q> {
    fn enqueue_or_replace(&self, key: &QueueKey) -> Result<QueueItem, SyncError> {
        (**self).enqueue_or_replace(key)
    }

    fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        (**self).list_pending()
    }

    fn ack(&self, item: &QueueItem) -> Result<bool, SyncError> {
        (**self).ack(item)
    }

    fn record_failure(&self, item: &QueueItem) -> Result<u32, SyncError> {
        (**self).record_failure(item)
    }

    fn len(&self) -> Result<usize, SyncError> {
        (**self).len()
    }
}

/// Queue depth and convergence lag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    /// Age of the oldest pending marker in seconds (0 when empty).
    pub oldest_age_secs: u64,
    /// Markers at or above the retry alert threshold.
    pub failing_keys: usize,
}

impl QueueStats {
    pub fn collect(queue: &dyn RetryQueue, alert_threshold: u32) -> Result<Self, SyncError> {
        let pending = queue.list_pending()?;
        let now = now_nanos();
        Ok(Self {
            depth: pending.len(),
            oldest_age_secs: pending
                .iter()
                .map(|item| item.age_secs(now))
                .max()
                .unwrap_or(0),
            failing_keys: pending
                .iter()
                .filter(|item| item.attempts >= alert_threshold)
                .count(),
        })
    }
}

// =============================================================================
// CLAIM SET
// =============================================================================

/// In-process guard against processing the same key twice concurrently.
///
/// The queue's one-marker-per-key invariant already serializes work across
/// drain passes; the claim set covers overlapping passes inside one process.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    claimed: Arc<Mutex<BTreeSet<QueueKey>>>,
}

impl ClaimSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `None` if it is already being processed.
    #[must_use]
    pub fn try_claim(&self, key: &QueueKey) -> Option<Claim> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if claimed.insert(key.clone()) {
            Some(Claim {
                key: key.clone(),
                set: Arc::clone(&self.claimed),
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A held claim; released on drop.
#[derive(Debug)]
pub struct Claim {
    key: QueueKey,
    set: Arc<Mutex<BTreeSet<QueueKey>>>,
}

impl Claim {
    #[must_use]
    pub fn key(&self) -> &QueueKey {
        &self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorKey, Kind};

    fn key(actor: &str) -> QueueKey {
        QueueKey::new(ActorKey::parse(actor).expect("key"), Kind(3))
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let claims = ClaimSet::new();
        let first = claims.try_claim(&key("alice")).expect("first claim");
        assert!(claims.try_claim(&key("alice")).is_none());
        assert!(claims.try_claim(&key("bob")).is_some());

        drop(first);
        assert!(claims.try_claim(&key("alice")).is_some());
        assert!(claims.is_empty());
    }

    #[test]
    fn age_is_saturating() {
        let item = QueueItem {
            key: key("alice"),
            enqueued_at: 5_000_000_000,
            attempts: 0,
        };
        assert_eq!(item.age_secs(7_500_000_000), 2);
        assert_eq!(item.age_secs(0), 0);
    }

    #[test]
    fn marker_json_is_flat() {
        let item = QueueItem {
            key: key("alice"),
            enqueued_at: 1,
            attempts: 2,
        };
        let json = serde_json::to_value(&item).expect("encode");
        assert_eq!(json["actor"], "alice");
        assert_eq!(json["kind"], 3);
        assert_eq!(json["attempts"], 2);
    }
}
