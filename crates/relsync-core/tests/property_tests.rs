//! # Property-Based Tests
//!
//! Convergence and idempotence of the diff-and-apply engine for arbitrary
//! before/after target sets, and order independence of replaceable events.

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use relsync_core::{
    ActorKey, EdgeType, Event, EventId, EventLog, GraphStore, Kind, MemoryGraph, QueueKey,
    Reconciler, TaskQueue, TaskType, PrioritizedTask,
};
use std::collections::BTreeSet;

fn follow_list(id: u64, at: u64, targets: &[u16]) -> Event {
    Event {
        id: EventId::parse(format!("e{id}")).expect("id"),
        actor: ActorKey::parse("source").expect("actor"),
        kind: Kind(3),
        created_at: at,
        tags: targets
            .iter()
            .map(|t| vec!["p".to_string(), format!("t{t}")])
            .collect(),
    }
}

fn current_targets(graph: &MemoryGraph) -> BTreeSet<String> {
    graph
        .edge_targets(&ActorKey::parse("source").expect("actor"), &EdgeType::new("FOLLOWS"))
        .expect("targets")
        .into_iter()
        .map(String::from)
        .collect()
}

proptest! {
    /// After any sequence of newer events the edges equal the last event's targets.
    #[test]
    fn converges_to_latest_target_set(
        lists in vec(vec(0u16..40, 0..30), 1..8)
    ) {
        let engine = Reconciler::default();
        let mut graph = MemoryGraph::new();

        for (i, targets) in lists.iter().enumerate() {
            let event = follow_list(i as u64, i as u64 + 1, targets);
            engine.reconcile_event(&mut graph, &event).expect("apply");
        }

        let expected: BTreeSet<String> = lists
            .last()
            .map(|l| l.iter().map(|t| format!("t{t}")).collect())
            .unwrap_or_default();
        prop_assert_eq!(current_targets(&graph), expected);
    }

    /// Re-applying the same event never writes.
    #[test]
    fn replay_is_write_free(
        before in vec(0u16..40, 0..30),
        after in vec(0u16..40, 0..30)
    ) {
        let engine = Reconciler::default();
        let mut graph = MemoryGraph::new();
        engine.reconcile_event(&mut graph, &follow_list(1, 1, &before)).expect("before");
        let latest = follow_list(2, 2, &after);
        engine.reconcile_event(&mut graph, &latest).expect("after");

        let writes = graph.write_count();
        engine.reconcile_event(&mut graph, &latest).expect("replay");
        prop_assert_eq!(graph.write_count(), writes);
    }

    /// The delta sizes match the set differences.
    #[test]
    fn delta_is_minimal(
        before in btree_set(0u16..40, 0..30),
        after in btree_set(0u16..40, 0..30)
    ) {
        let engine = Reconciler::default();
        let mut graph = MemoryGraph::new();
        let before_list: Vec<u16> = before.iter().copied().collect();
        let after_list: Vec<u16> = after.iter().copied().collect();
        engine.reconcile_event(&mut graph, &follow_list(1, 1, &before_list)).expect("before");

        let outcome = engine
            .reconcile_event(&mut graph, &follow_list(2, 2, &after_list))
            .expect("after");
        let (added, removed) = match outcome {
            relsync_core::ApplyOutcome::Applied { added, removed, .. } => (added, removed),
            _ => (usize::MAX, usize::MAX),
        };
        prop_assert_eq!(added, after.difference(&before).count());
        prop_assert_eq!(removed, before.difference(&after).count());
    }

    /// The event log picks the same current event whatever the arrival order.
    #[test]
    fn event_log_is_order_independent(
        stamps in vec((0u64..5, 0u64..1000), 1..20)
    ) {
        let events: Vec<Event> = stamps
            .iter()
            .enumerate()
            .map(|(i, (at, salt))| follow_list(i as u64 * 1000 + salt, *at, &[]))
            .collect();

        let mut forward = EventLog::new();
        for event in events.iter().cloned() {
            forward.insert(event);
        }
        let mut backward = EventLog::new();
        for event in events.iter().rev().cloned() {
            backward.insert(event);
        }

        let key = QueueKey::new(ActorKey::parse("source").expect("actor"), Kind(3));
        prop_assert_eq!(
            forward.latest(&key).map(|e| e.id.clone()),
            backward.latest(&key).map(|e| e.id.clone())
        );
    }

    /// Popping a task queue yields non-decreasing priorities with no duplicates.
    #[test]
    fn task_queue_pops_in_priority_order(
        tasks in vec((0u8..3, 0u8..5, 0u32..50), 0..40)
    ) {
        let mut queue = TaskQueue::new();
        for (ty, target, priority) in &tasks {
            let task_type = match ty {
                0 => TaskType::FullRebuild,
                1 => TaskType::Sweep,
                _ => TaskType::ProcessQueue,
            };
            queue.push(PrioritizedTask::new(task_type, format!("t{target}"), *priority));
        }

        let mut seen = BTreeSet::new();
        let mut last = 0;
        while let Some(task) = queue.pop() {
            prop_assert!(task.priority >= last);
            prop_assert!(seen.insert((task.task_type, task.target.clone())));
            last = task.priority;
        }
    }
}
