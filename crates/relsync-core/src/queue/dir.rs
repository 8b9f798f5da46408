//! Directory-backed retry queue: one JSON marker file per key.
//!
//! Marker files are named `<actor>.<kind>.json`. Writes go to a fresh
//! `tempfile` in the queue directory, are synced, then persisted over the
//! marker, so a reader never observes a half-written marker and concurrent
//! overwrites of one key are last-write-wins.
//!
//! `ack` and `record_failure` first claim the marker by renaming it to a
//! private `.claim` file. An enqueue racing with them either lands before
//! the claim (the claimed generation then differs and the marker is put
//! back) or after it (a new marker the claimer never touches). Putting a
//! marker back never clobbers a newer one. Unreadable files are moved to
//! `quarantine/` under a unique name.

use super::{QueueItem, RetryQueue};
use crate::primitives::{MARKER_EXTENSION, QUARANTINE_NAME};
use crate::{ActorKey, Kind, QueueKey, SyncError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile, TempPath};

/// Extension of claimed markers; never listed.
const CLAIM_EXTENSION: &str = "claim";

/// Prefix `tempfile` gives in-flight writes.
const TMP_PREFIX: &str = ".tmp";

/// Directory of marker files.
#[derive(Debug)]
pub struct DirQueue {
    root: PathBuf,
    quarantine: PathBuf,
}

impl DirQueue {
    /// Open (creating if needed) a queue rooted at `root`.
    ///
    /// Claims left by a crashed process are put back as markers and
    /// abandoned temp files are removed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SyncError> {
        let root = root.as_ref().to_path_buf();
        let quarantine = root.join(QUARANTINE_NAME);
        fs::create_dir_all(&quarantine)?;
        let queue = Self { root, quarantine };
        queue.recover()?;
        Ok(queue)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of quarantined files.
    pub fn quarantined(&self) -> Result<usize, SyncError> {
        Ok(fs::read_dir(&self.quarantine)?.count())
    }

    fn marker_path(&self, key: &QueueKey) -> PathBuf {
        self.root
            .join(format!("{}.{}.{MARKER_EXTENSION}", key.actor, key.kind))
    }

    /// Encode `item` into a synced temp file in the queue directory.
    fn stage(&self, item: &QueueItem) -> Result<NamedTempFile, SyncError> {
        let bytes =
            serde_json::to_vec(item).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let mut staged = Builder::new().prefix(TMP_PREFIX).tempfile_in(&self.root)?;
        staged.write_all(&bytes)?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }

    fn write_marker(&self, item: &QueueItem) -> Result<(), SyncError> {
        self.stage(item)?
            .persist(self.marker_path(&item.key))
            .map_err(|e| SyncError::from(e.error))?;
        Ok(())
    }

    /// Write `item` only if no marker exists for its key.
    ///
    /// Returns `false` when a newer marker is already in place.
    fn write_marker_if_absent(&self, item: &QueueItem) -> Result<bool, SyncError> {
        match self.stage(item)?.persist_noclobber(self.marker_path(&item.key)) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Move the marker for `key` to a private claim file.
    ///
    /// `None` if there is no marker. The claim file is deleted when the
    /// returned path is dropped.
    fn claim(&self, key: &QueueKey) -> Result<Option<TempPath>, SyncError> {
        let claim = Builder::new()
            .prefix(&format!(".{}.{}.", key.actor, key.kind))
            .suffix(&format!(".{CLAIM_EXTENSION}"))
            .tempfile_in(&self.root)?
            .into_temp_path();
        match fs::rename(self.marker_path(key), &claim) {
            Ok(()) => Ok(Some(claim)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Put a claimed marker back unless a newer one has been enqueued.
    fn release(&self, claim: &TempPath, key: &QueueKey) -> Result<(), SyncError> {
        match fs::hard_link(claim, self.marker_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(key = %key, "newer marker present; dropping claimed one");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a claimed marker, quarantining it if unreadable.
    fn read_claim(&self, claim: &TempPath, key: &QueueKey) -> Result<Option<QueueItem>, SyncError> {
        match read_item(claim, Some(key)) {
            Ok(item) => Ok(item),
            Err(e @ SyncError::QueueCorruption { .. }) => {
                self.quarantine(claim, &e);
                Ok(None)
            }
            Err(e) => {
                self.release(claim, key)?;
                Err(e)
            }
        }
    }

    /// Move an unreadable file aside instead of failing the consumer loop.
    fn quarantine(&self, path: &Path, reason: &SyncError) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let moved = Builder::new()
            .prefix(&format!("{name}."))
            .tempfile_in(&self.quarantine)
            .and_then(|dest| {
                let dest = dest.into_temp_path();
                fs::rename(path, &dest)?;
                dest.keep().map_err(|e| e.error)
            });
        match moved {
            Ok(dest) => tracing::warn!(
                marker = %path.display(),
                quarantined = %dest.display(),
                error = %reason,
                "quarantined unreadable queue marker"
            ),
            Err(e) => tracing::error!(
                marker = %path.display(),
                error = %e,
                "failed to quarantine queue marker"
            ),
        }
    }

    fn files_with_extension(&self, extension: &str) -> Result<Vec<PathBuf>, SyncError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == extension) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn marker_files(&self) -> Result<Vec<PathBuf>, SyncError> {
        self.files_with_extension(MARKER_EXTENSION)
    }

    /// Restore claims of a crashed process and clear abandoned temp files.
    ///
    /// A restored claim may already have been applied; processing it again
    /// writes nothing.
    fn recover(&self) -> Result<(), SyncError> {
        for path in self.files_with_extension(CLAIM_EXTENSION)? {
            // Reserved but never filled: the process died before the rename.
            if fs::metadata(&path)?.len() == 0 {
                fs::remove_file(&path)?;
                continue;
            }
            match read_item(&path, None) {
                Ok(Some(item)) => {
                    if self.write_marker_if_absent(&item)? {
                        tracing::info!(key = %item.key, "restored claimed queue marker");
                    }
                    fs::remove_file(&path)?;
                }
                Ok(None) => {}
                Err(e @ SyncError::QueueCorruption { .. }) => self.quarantine(&path, &e),
                Err(e) => return Err(e),
            }
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let abandoned = path.is_file()
                && path.extension().is_none()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TMP_PREFIX));
            if abandoned {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Decode a marker file, checking it names `expected` (or, for plain
/// markers, the key encoded in its file name).
fn read_item(path: &Path, expected: Option<&QueueKey>) -> Result<Option<QueueItem>, SyncError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let item: QueueItem =
        serde_json::from_slice(&bytes).map_err(|e| SyncError::QueueCorruption {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let matches = match expected {
        Some(key) => *key == item.key,
        None if path.extension().is_some_and(|ext| ext == MARKER_EXTENSION) => {
            key_from_file_name(path).as_ref() == Some(&item.key)
        }
        None => true,
    };
    if !matches {
        return Err(SyncError::QueueCorruption {
            path: path.display().to_string(),
            reason: format!("marker content names {}", item.key),
        });
    }
    Ok(Some(item))
}

/// Recover the key encoded in a marker file name.
fn key_from_file_name(path: &Path) -> Option<QueueKey> {
    let stem = path.file_stem()?.to_str()?;
    let (actor, kind) = stem.rsplit_once('.')?;
    Some(QueueKey::new(
        ActorKey::parse(actor).ok()?,
        Kind(kind.parse().ok()?),
    ))
}

impl RetryQueue for DirQueue {
    fn enqueue_or_replace(&self, key: &QueueKey) -> Result<QueueItem, SyncError> {
        let item = QueueItem::new(key.clone());
        self.write_marker(&item)?;
        Ok(item)
    }

    fn list_pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        let mut items = Vec::new();
        for path in self.marker_files()? {
            match read_item(&path, None) {
                Ok(Some(item)) => items.push(item),
                // Acked between read_dir and read.
                Ok(None) => {}
                Err(e @ SyncError::QueueCorruption { .. }) => self.quarantine(&path, &e),
                Err(e) => return Err(e),
            }
        }
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.key.cmp(&b.key)));
        Ok(items)
    }

    fn ack(&self, item: &QueueItem) -> Result<bool, SyncError> {
        let Some(claim) = self.claim(&item.key)? else {
            return Ok(false);
        };
        let Some(current) = self.read_claim(&claim, &item.key)? else {
            return Ok(false);
        };
        if current.enqueued_at != item.enqueued_at {
            tracing::debug!(key = %item.key, "marker replaced during apply; keeping it");
            self.release(&claim, &item.key)?;
            return Ok(false);
        }
        claim.close()?;
        Ok(true)
    }

    fn record_failure(&self, item: &QueueItem) -> Result<u32, SyncError> {
        let Some(claim) = self.claim(&item.key)? else {
            return Ok(0);
        };
        let Some(mut current) = self.read_claim(&claim, &item.key)? else {
            return Ok(0);
        };
        current.attempts = current.attempts.saturating_add(1);
        if self.write_marker_if_absent(&current)? {
            Ok(current.attempts)
        } else {
            // Re-enqueued meanwhile; the fresh marker starts at zero.
            Ok(0)
        }
    }

    fn len(&self) -> Result<usize, SyncError> {
        Ok(self.marker_files()?.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================
