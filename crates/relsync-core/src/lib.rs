//! # relsync-core
//!
//! The reconciliation engine for relsync - THE LOGIC.
//!
//! Keeps a materialized relationship graph in step with an upstream log of
//! replaceable events: each actor publishes at most one current event per
//! kind, and that event's tags define all of the actor's outgoing edges of
//! the kind's type.
//!
//! ## Pipeline
//!
//! - `coalescer`: live events become one queue marker per `(actor, kind)`
//! - `queue`: durable retry queue of markers (directory or redb)
//! - `reconcile`: fetch-diff-apply of one key against the graph
//! - `sweep`: periodic comparison of upstream heads and checkpoints
//! - `bulk`: parallel extraction of a full export and the matching loader
//! - `scheduler`: policy contract deciding when sweeps and rebuilds run
//!
//! ## Architectural Constraints
//!
//! - NO async, NO network dependencies; event sources live in the binary
//! - Deterministic iteration (`BTreeMap`/`BTreeSet`) wherever output is written
//! - Crash-only: the queue and the graph are the only state that survives a
//!   restart, and they are enough to resume

// =============================================================================
// MODULES
// =============================================================================

pub mod bulk;
pub mod coalescer;
pub mod event_log;
pub mod graph;
pub mod ingestor;
pub mod primitives;
pub mod queue;
pub mod reconcile;
pub mod relation;
pub mod scheduler;
pub mod storage;
pub mod sweep;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ActorKey, Checkpoint, EdgeAttrs, EdgeType, Event, EventId, Kind, QueueKey, SyncError,
};

// =============================================================================
// RE-EXPORTS: Pipeline
// =============================================================================

pub use bulk::{BulkConfig, BulkExtractor, BulkReport, LoadReport, load_tables};
pub use coalescer::{Coalescer, CoalescerStats, Observation};
pub use event_log::{EventLog, newest};
pub use graph::{GraphStore, MemoryGraph};
pub use ingestor::{Ingestor, LineStats};
pub use queue::{ClaimSet, DirQueue, QueueItem, QueueStats, RetryQueue};
pub use reconcile::{
    ApplyOutcome, EdgeDelta, MissingEventPolicy, ReconcileStats, Reconciler, compute_delta,
};
pub use relation::{RelationKind, RelationRegistry};
pub use scheduler::{
    DefaultPolicy, PrioritizedTask, SchedulerPolicy, SystemState, TaskQueue, TaskType,
};
pub use storage::{RedbGraph, RedbQueue};
pub use sweep::{SweepPlanner, SweepReport};
