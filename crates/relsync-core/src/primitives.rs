//! # Pipeline Primitives
//!
//! Hardcoded limits and defaults for the reconciliation pipeline.
//!
//! Values that operators tune (concurrency, batch sizes, paths) are only
//! defaults here; the binary overrides them from its configuration file.

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length of an actor key in bytes.
///
/// Keys longer than this are rejected at parse time so that queue marker
/// file names stay well under filesystem limits.
pub const MAX_KEY_LENGTH: usize = 128;

/// Maximum length of an event id in bytes.
pub const MAX_EVENT_ID_LENGTH: usize = 128;

/// Maximum length of a single NDJSON line accepted from an event source.
///
/// Longer lines are treated as malformed, never buffered further.
pub const MAX_EVENT_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Maximum number of tags inspected on one event.
pub const MAX_TAGS_PER_EVENT: usize = 100_000;

// =============================================================================
// QUEUE & ENGINE DEFAULTS
// =============================================================================

/// Default number of keys reconciled concurrently.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default number of queue items taken per drain pass.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Number of failed attempts after which a key is reported as stuck.
pub const DEFAULT_RETRY_ALERT_THRESHOLD: u32 = 10;

/// File extension of directory-queue markers.
pub const MARKER_EXTENSION: &str = "json";

/// Sub-directory (or table) receiving unreadable markers.
pub const QUARANTINE_NAME: &str = "quarantine";

// =============================================================================
// SWEEP & BULK DEFAULTS
// =============================================================================

/// Default number of actors compared per sweep batch.
pub const DEFAULT_SWEEP_BATCH: usize = 500;

/// Default cap on lines held by one bulk chunk.
///
/// Bounds coordinator memory independently of corpus size.
pub const DEFAULT_MAX_CHUNK_LINES: usize = 250_000;

/// Bulk output file: deduplicated actor keys.
pub const NODES_FILE: &str = "nodes.csv";

/// Bulk output file: one row per target-bearing tag.
pub const RELATIONSHIPS_FILE: &str = "relationships.csv";

/// Bulk output file: one row per valid event.
pub const EVENTS_FILE: &str = "events.csv";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_files_are_distinct() {
        assert_ne!(NODES_FILE, RELATIONSHIPS_FILE);
        assert_ne!(RELATIONSHIPS_FILE, EVENTS_FILE);
        assert_ne!(NODES_FILE, EVENTS_FILE);
    }

    #[test]
    fn default_concurrency_is_small() {
        assert!(DEFAULT_CONCURRENCY > 0 && DEFAULT_CONCURRENCY <= 16);
    }
}
