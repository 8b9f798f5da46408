//! End-to-end tests of the service pipeline over on-disk state: redb graph,
//! both queue backends, a file event source and the bulk rebuild path.

#![allow(clippy::unwrap_used, clippy::panic)]

use relsync::config::{Config, QueueBackend};
use relsync::pipeline::Pipeline;
use relsync::source::{EventSource, Source};
use relsync_core::{
    ActorKey, BulkConfig, EdgeType, Event, EventId, GraphStore, Kind, QueueKey, RetryQueue,
};
use std::io::Write;
use std::path::Path;

fn follow_line(id: &str, actor: &str, at: u64, targets: &[&str]) -> String {
    let tags: Vec<String> = targets.iter().map(|t| format!(r#"["p","{t}"]"#)).collect();
    format!(
        r#"{{"id":"{id}","pubkey":"{actor}","kind":3,"created_at":{at},"tags":[{}]}}"#,
        tags.join(",")
    )
}

fn config(dir: &Path, backend: QueueBackend, export: &Path) -> Config {
    let mut config = Config::default();
    config.store.path = dir.join("graph.redb");
    config.queue.backend = backend;
    config.queue.path = match backend {
        QueueBackend::Dir => dir.join("queue"),
        QueueBackend::Redb => dir.join("queue.redb"),
    };
    config.source.file = Some(export.to_path_buf());
    config.bulk.output = dir.join("bulk");
    config.validate().unwrap();
    config
}

fn write_export(path: &Path, lines: &[String]) {
    let mut file = std::fs::File::create(path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

async fn follows(pipeline: &Pipeline, actor: &str) -> Vec<String> {
    let graph = pipeline.graph().read().await;
    graph
        .edge_targets(&ActorKey::parse(actor).unwrap(), &EdgeType::new("FOLLOWS"))
        .unwrap()
        .into_iter()
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn rebuild_then_incremental_update() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.jsonl");
    write_export(
        &export,
        &[
            follow_line("a1", "alice", 1, &["x", "y"]),
            follow_line("a2", "alice", 2, &["y", "z"]),
            follow_line("b1", "bob", 1, &["alice"]),
            "garbage".to_string(),
        ],
    );
    let config = config(dir.path(), QueueBackend::Dir, &export);
    let pipeline = Pipeline::from_config(&config).unwrap();

    let bulk = BulkConfig {
        workers: Some(2),
        max_chunk_lines: 1,
    };
    let rebuild = pipeline
        .rebuild(&export, &config.bulk.output, bulk)
        .await
        .unwrap();
    assert!(rebuild.extract.complete);
    assert_eq!(rebuild.extract.malformed_lines, 1);
    let load = rebuild.load.unwrap();
    assert_eq!(load.current_events, 2);
    assert_eq!(follows(&pipeline, "alice").await, vec!["y", "z"]);

    // An update the export did not have.
    let Source::File(source) = pipeline.source() else {
        panic!("file source expected");
    };
    let event: Event = serde_json::from_str(&follow_line("a3", "alice", 3, &["bob"])).unwrap();
    source.insert(event);
    let key = QueueKey::new(ActorKey::parse("alice").unwrap(), Kind(3));
    pipeline.queue().enqueue_or_replace(&key).unwrap();

    let stats = pipeline.drain_all().await.unwrap();
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.edges_added, 1);
    assert_eq!(stats.edges_removed, 2);
    assert_eq!(follows(&pipeline, "alice").await, vec!["bob"]);

    let graph = pipeline.graph().read().await;
    let checkpoint = graph.checkpoint(&key.actor, Kind(3)).unwrap().unwrap();
    assert_eq!(checkpoint.event_id, EventId::parse("a3").unwrap());
}

#[tokio::test]
async fn redb_queue_backend_drains_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.jsonl");
    write_export(&export, &[follow_line("c1", "carol", 5, &["dave"])]);
    let config = config(dir.path(), QueueBackend::Redb, &export);

    let key = QueueKey::new(ActorKey::parse("carol").unwrap(), Kind(3));
    {
        let pipeline = Pipeline::from_config(&config).unwrap();
        pipeline.queue().enqueue_or_replace(&key).unwrap();
    }

    // A fresh process sees the marker and applies it.
    let pipeline = Pipeline::from_config(&config).unwrap();
    assert_eq!(pipeline.queue().len().unwrap(), 1);
    let latest = pipeline.source().latest(&key).await.unwrap();
    assert!(latest.is_some());

    let stats = pipeline.drain_all().await.unwrap();
    assert_eq!(stats.applied, 1);
    assert!(pipeline.queue().is_empty().unwrap());
    assert_eq!(follows(&pipeline, "carol").await, vec!["dave"]);
}

#[tokio::test]
async fn sweep_over_redb_graph_enqueues_missed_update() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.jsonl");
    write_export(&export, &[follow_line("d1", "dan", 1, &["erin"])]);
    let config = config(dir.path(), QueueBackend::Dir, &export);
    let pipeline = Pipeline::from_config(&config).unwrap();

    let key = QueueKey::new(ActorKey::parse("dan").unwrap(), Kind(3));
    pipeline.queue().enqueue_or_replace(&key).unwrap();
    pipeline.drain_all().await.unwrap();
    assert_eq!(pipeline.sweep_once(10).await.unwrap().mismatches, 0);

    let Source::File(source) = pipeline.source() else {
        panic!("file source expected");
    };
    let event: Event = serde_json::from_str(&follow_line("d2", "dan", 2, &[])).unwrap();
    source.insert(event);

    let report = pipeline.sweep_once(10).await.unwrap();
    assert_eq!(report.enqueued, 1);
    pipeline.drain_all().await.unwrap();
    assert!(follows(&pipeline, "dan").await.is_empty());
}
