//! # API Request/Response Types
//!
//! JSON bodies of the operations endpoint.

use relsync_core::{PrioritizedTask, QueueStats};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Queue depth, convergence lag and graph size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub queue: QueueStats,
    pub node_count: usize,
    pub edge_count: usize,
    /// Seconds since the last sweep; `None` if none ran since start.
    pub last_sweep_age_secs: Option<u64>,
    /// Scheduler tasks waiting to run, most urgent first.
    pub pending_tasks: Vec<PrioritizedTask>,
    pub watched_kinds: Vec<u32>,
    pub source: String,
}

/// Answer to a trigger request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// `false` if an equal or more urgent task was already queued.
    pub queued: bool,
    pub task: PrioritizedTask,
    pub pending: usize,
}

/// Error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
