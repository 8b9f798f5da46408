//! NDJSON export as an event source.

use super::EventSource;
use relsync_core::{ActorKey, Checkpoint, Event, EventLog, Kind, QueueKey, SyncError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::RwLock;

/// A replaceable event log loaded from disk.
///
/// Events can be added after loading, which is how tests and the `watch`
/// command simulate upstream updates.
#[derive(Debug, Default)]
pub struct FileEventSource {
    log: RwLock<EventLog>,
}

impl FileEventSource {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let file = File::open(path)
            .map_err(|e| SyncError::Io(format!("cannot open {}: {e}", path.display())))?;
        let (log, stats) = EventLog::from_ndjson(BufReader::new(file))?;
        tracing::info!(
            path = %path.display(),
            accepted = stats.accepted,
            malformed = stats.malformed,
            current = log.len(),
            "loaded event export"
        );
        Ok(Self::from_log(log))
    }

    pub fn from_log(log: EventLog) -> Self {
        Self {
            log: RwLock::new(log),
        }
    }

    /// Record an upstream event. Returns `true` if it became current.
    pub fn insert(&self, event: Event) -> bool {
        self.log
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event)
    }

    /// Delete the current event of `key` upstream.
    pub fn remove(&self, key: &QueueKey) -> Option<Event> {
        self.log
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for FileEventSource {
    async fn latest(&self, key: &QueueKey) -> Result<Option<Event>, SyncError> {
        let log = self.log.read().unwrap_or_else(|e| e.into_inner());
        Ok(log.latest(key).cloned())
    }

    async fn heads(
        &self,
        actors: &[ActorKey],
        kinds: &[Kind],
    ) -> Result<Vec<(QueueKey, Checkpoint)>, SyncError> {
        let log = self.log.read().unwrap_or_else(|e| e.into_inner());
        Ok(log.heads(actors, kinds))
    }
}
