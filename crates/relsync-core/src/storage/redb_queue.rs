//! # redb-backed Retry Queue
//!
//! One row per pending key in an embedded redb database. Suits a single
//! long-running process (redb holds an exclusive file lock); use
//! [`crate::queue::DirQueue`] when separate processes share the queue.

use crate::primitives::QUARANTINE_NAME;
use crate::queue::{QueueItem, RetryQueue};
use crate::{ActorKey, Kind, QueueKey, SyncError};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

/// Table for markers: (actor, kind) -> (enqueued_at, attempts)
const PENDING: TableDefinition<(&str, u32), (u64, u32)> = TableDefinition::new("pending");

/// Table for unreadable markers: raw actor string + kind -> reason
const QUARANTINE: TableDefinition<(&str, u32), &str> = TableDefinition::new(QUARANTINE_NAME);

fn read_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Transient(e.to_string())
}

fn write_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::StoreWrite(e.to_string())
}

/// A durable key-set stored in redb.
pub struct RedbQueue {
    db: Database,
}

impl std::fmt::Debug for RedbQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbQueue").finish_non_exhaustive()
    }
}

impl RedbQueue {
    /// Open or create a queue database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let db = Database::create(path.as_ref()).map_err(|e| SyncError::Io(e.to_string()))?;
        let write_txn = db.begin_write().map_err(write_err)?;
        {
            let _ = write_txn.open_table(PENDING).map_err(write_err)?;
            let _ = write_txn.open_table(QUARANTINE).map_err(write_err)?;
        }
        write_txn.commit().map_err(write_err)?;
        Ok(Self { db })
    }

    /// Number of quarantined rows.
    pub fn quarantined(&self) -> Result<usize, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(QUARANTINE).map_err(read_err)?;
        Ok(table.len().map_err(read_err)? as usize)
    }

    /// Move rows whose key no longer validates out of the pending table.
    fn quarantine(&self, rows: &[(String, u32, String)]) -> Result<(), SyncError> {
        let write_txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut pending = write_txn.open_table(PENDING).map_err(write_err)?;
            let mut quarantine = write_txn.open_table(QUARANTINE).map_err(write_err)?;
            for (actor, kind, reason) in rows {
                pending
                    .remove((actor.as_str(), *kind))
                    .map_err(write_err)?;
                quarantine
                    .insert((actor.as_str(), *kind), reason.as_str())
                    .map_err(write_err)?;
                tracing::warn!(actor = %actor, kind, reason = %reason, "quarantined unreadable queue row");
            }
        }
        write_txn.commit().map_err(write_err)
    }

    fn get(&self, key: &QueueKey) -> Result<Option<(u64, u32)>, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(PENDING).map_err(read_err)?;
        Ok(table
            .get((key.actor.as_str(), key.kind.0))
            .map_err(read_err)?
            .map(|v| v.value()))
    }
}

impl RetryQueue for RedbQueue {
    fn enqueue_or_replace(&self, key: &QueueKey) -> Result<QueueItem, SyncError> {
        let item = QueueItem::new(key.clone());
        let write_txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = write_txn.open_table(PENDING).map_err(write_err)?;
            table
                .insert((key.actor.as_str(), key.kind.0), (item.enqueued_at, 0))
                .map_err(write_err)?;
        }
        write_txn.commit().map_err(write_err)?;
        Ok(item)
    }

    fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        let mut items = Vec::new();
        let mut corrupt = Vec::new();
        {
            let read_txn = self.db.begin_read().map_err(read_err)?;
            let table = read_txn.open_table(PENDING).map_err(read_err)?;
            for entry in table.iter().map_err(read_err)? {
                let (key, value) = entry.map_err(read_err)?;
                let (actor, kind) = key.value();
                let (enqueued_at, attempts) = value.value();
                match ActorKey::parse(actor) {
                    Ok(actor) => items.push(QueueItem {
                        key: QueueKey::new(actor, Kind(kind)),
                        enqueued_at,
                        attempts,
                    }),
                    Err(e) => corrupt.push((actor.to_string(), kind, e.to_string())),
                }
            }
        }
        if !corrupt.is_empty() {
            self.quarantine(&corrupt)?;
        }
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.key.cmp(&b.key)));
        Ok(items)
    }

    fn ack(&self, item: &QueueItem) -> Result<bool, SyncError> {
        let write_txn = self.db.begin_write().map_err(write_err)?;
        let removed = {
            let mut table = write_txn.open_table(PENDING).map_err(write_err)?;
            let k = (item.key.actor.as_str(), item.key.kind.0);
            let current = table.get(k).map_err(read_err)?.map(|v| v.value());
            match current {
                Some((enqueued_at, _)) if enqueued_at == item.enqueued_at => {
                    table.remove(k).map_err(write_err)?;
                    true
                }
                Some(_) => {
                    tracing::debug!(key = %item.key, "marker replaced during apply; keeping it");
                    false
                }
                None => false,
            }
        };
        write_txn.commit().map_err(write_err)?;
        Ok(removed)
    }

    fn record_failure(&self, item: &QueueItem) -> Result<u32, SyncError> {
        let Some((enqueued_at, attempts)) = self.get(&item.key)? else {
            return Ok(0);
        };
        let attempts = attempts.saturating_add(1);
        let write_txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = write_txn.open_table(PENDING).map_err(write_err)?;
            table
                .insert(
                    (item.key.actor.as_str(), item.key.kind.0),
                    (enqueued_at, attempts),
                )
                .map_err(write_err)?;
        }
        write_txn.commit().map_err(write_err)?;
        Ok(attempts)
    }

    fn len(&self) -> Result<usize, SyncError> {
        let read_txn = self.db.begin_read().map_err(read_err)?;
        let table = read_txn.open_table(PENDING).map_err(read_err)?;
        Ok(table.len().map_err(read_err)? as usize)
    }
}

// =============================================================================
// TESTS
// =============================================================================
