//! # Task Scheduler Contract
//!
//! A policy looks at a snapshot of the system and proposes tasks; the
//! [`TaskQueue`] merges proposals from every source (policy ticks, manual
//! triggers) into one priority order that drivers consume.
//!
//! Lower priority values are more urgent. A task is identified by
//! `(type, target)`; proposing it again keeps one entry with the more urgent
//! of the two priorities.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Priority of a full rebuild proposed for an empty graph.
pub const REBUILD_PRIORITY: u32 = 0;

/// Priority of draining the retry queue.
pub const PROCESS_QUEUE_PRIORITY: u32 = 10;

/// Priority of a due comparison sweep.
pub const SWEEP_PRIORITY: u32 = 20;

/// Target naming the whole graph.
pub const TARGET_GRAPH: &str = "graph";

/// Target naming the retry queue.
pub const TARGET_QUEUE: &str = "queue";

/// Kinds of work a driver knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FullRebuild,
    Sweep,
    ProcessQueue,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::FullRebuild => "full_rebuild",
            TaskType::Sweep => "sweep",
            TaskType::ProcessQueue => "process_queue",
        };
        f.write_str(name)
    }
}

/// A unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioritizedTask {
    pub task_type: TaskType,
    pub target: String,
    pub priority: u32,
}

impl PrioritizedTask {
    #[must_use]
    pub fn new(task_type: TaskType, target: impl Into<String>, priority: u32) -> Self {
        Self {
            task_type,
            target: target.into(),
            priority,
        }
    }
}

/// Snapshot the policy decides on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub queue_depth: usize,
    /// Seconds since the last completed sweep; `None` if none ran yet.
    pub last_sweep_age_secs: Option<u64>,
    /// Seconds since the last attempted rebuild; `None` if none ran yet.
    pub last_rebuild_age_secs: Option<u64>,
    pub graph_empty: bool,
    pub failing_keys: usize,
}

/// Pluggable scheduling policy.
pub trait SchedulerPolicy: Send + Sync {
    fn evaluate(&self, state: &SystemState) -> Vec<PrioritizedTask>;
}

/// Rebuild an empty graph, drain a non-empty queue, sweep when due.
///
/// A rebuild that left the graph empty (incomplete or empty export) is not
/// proposed again until `sweep_interval_secs` have passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultPolicy {
    pub sweep_interval_secs: u64,
}

impl DefaultPolicy {
    #[must_use]
    pub fn new(sweep_interval_secs: u64) -> Self {
        Self {
            sweep_interval_secs,
        }
    }
}

impl SchedulerPolicy for DefaultPolicy {
    fn evaluate(&self, state: &SystemState) -> Vec<PrioritizedTask> {
        let mut tasks = Vec::new();
        let rebuild_due = state
            .last_rebuild_age_secs
            .is_none_or(|age| age >= self.sweep_interval_secs);
        if state.graph_empty && rebuild_due {
            tasks.push(PrioritizedTask::new(
                TaskType::FullRebuild,
                TARGET_GRAPH,
                REBUILD_PRIORITY,
            ));
        }
        if state.queue_depth > 0 {
            tasks.push(PrioritizedTask::new(
                TaskType::ProcessQueue,
                TARGET_QUEUE,
                PROCESS_QUEUE_PRIORITY,
            ));
        }
        let sweep_due = state
            .last_sweep_age_secs
            .is_none_or(|age| age >= self.sweep_interval_secs);
        if sweep_due && !state.graph_empty {
            tasks.push(PrioritizedTask::new(
                TaskType::Sweep,
                TARGET_GRAPH,
                SWEEP_PRIORITY,
            ));
        }
        tasks
    }
}

// =============================================================================
// TASK QUEUE
// =============================================================================

type TaskKey = (TaskType, String);

/// Deduplicating priority queue of tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    /// (priority, arrival) -> task, in pop order.
    order: BTreeSet<(u32, u64, TaskKey)>,
    /// task -> (priority, arrival)
    index: BTreeMap<TaskKey, (u32, u64)>,
    next_seq: u64,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, or raise the urgency of the one already queued.
    ///
    /// Returns `true` if the queue changed.
    pub fn push(&mut self, task: PrioritizedTask) -> bool {
        let key = (task.task_type, task.target);
        match self.index.get(&key).copied() {
            Some((priority, _)) if priority <= task.priority => false,
            Some((priority, seq)) => {
                self.order.remove(&(priority, seq, key.clone()));
                self.order.insert((task.priority, seq, key.clone()));
                self.index.insert(key, (task.priority, seq));
                true
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.order.insert((task.priority, seq, key.clone()));
                self.index.insert(key, (task.priority, seq));
                true
            }
        }
    }

    /// Merge a batch of proposals. Returns how many changed the queue.
    pub fn merge(&mut self, tasks: impl IntoIterator<Item = PrioritizedTask>) -> usize {
        tasks.into_iter().filter(|task| self.push(task.clone())).count()
    }

    /// Most urgent task; FIFO among equal priorities.
    pub fn pop(&mut self) -> Option<PrioritizedTask> {
        let (priority, _, key) = self.order.pop_first()?;
        self.index.remove(&key);
        let (task_type, target) = key;
        Some(PrioritizedTask {
            task_type,
            target,
            priority,
        })
    }

    /// Queued tasks in pop order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PrioritizedTask> {
        self.order
            .iter()
            .map(|(priority, _, (task_type, target))| PrioritizedTask {
                task_type: *task_type,
                target: target.clone(),
                priority: *priority,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
