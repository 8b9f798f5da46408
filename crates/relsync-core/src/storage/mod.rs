//! # Persistent Storage
//!
//! redb-backed implementations of the graph store and the retry queue.

mod redb_graph;
mod redb_queue;

pub use redb_graph::RedbGraph;
pub use redb_queue::RedbQueue;
