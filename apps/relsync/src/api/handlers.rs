//! # API Endpoint Handlers

use super::{
    AppState,
    types::{ErrorResponse, HealthResponse, StatusResponse, TriggerResponse},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use relsync_core::{
    PrioritizedTask, TaskType,
    scheduler::{REBUILD_PRIORITY, SWEEP_PRIORITY, TARGET_GRAPH},
};

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// STATUS HANDLER
// =============================================================================

/// Queue depth, lag and graph size.
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let queue = match state.pipeline.queue_stats() {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "status: queue unreadable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response();
        }
    };

    let counts = {
        let graph = state.pipeline.graph().read().await;
        graph
            .node_count()
            .and_then(|nodes| graph.edge_count().map(|edges| (nodes, edges)))
    };
    let (node_count, edge_count) = match counts {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!(error = %e, "status: graph unreadable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response();
        }
    };

    let (pending_tasks, last_sweep_age_secs) = {
        let scheduler = state.scheduler.lock().await;
        (scheduler.tasks.snapshot(), scheduler.last_sweep_age_secs())
    };

    let response = StatusResponse {
        queue,
        node_count,
        edge_count,
        last_sweep_age_secs,
        pending_tasks,
        watched_kinds: state
            .pipeline
            .reconciler()
            .registry()
            .watched_kinds()
            .into_iter()
            .map(|k| k.0)
            .collect(),
        source: state.pipeline.source().describe(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

// =============================================================================
// TRIGGER HANDLERS
// =============================================================================

async fn enqueue_task(state: &AppState, task: PrioritizedTask) -> TriggerResponse {
    let (queued, pending) = {
        let mut scheduler = state.scheduler.lock().await;
        let queued = scheduler.tasks.push(task.clone());
        (queued, scheduler.tasks.len())
    };
    state.wake.notify_one();
    tracing::info!(task = %task.task_type, queued, "task triggered");
    TriggerResponse {
        queued,
        task,
        pending,
    }
}

/// Queue an incremental sweep.
pub async fn sweep_handler(State(state): State<AppState>) -> impl IntoResponse {
    let task = PrioritizedTask::new(TaskType::Sweep, TARGET_GRAPH, SWEEP_PRIORITY);
    let response = enqueue_task(&state, task).await;
    (StatusCode::ACCEPTED, Json(response))
}

/// Queue a full rebuild. Refused when no export is configured.
pub async fn rebuild_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.rebuild_enabled {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new("no bulk input configured (bulk.input)")),
        )
            .into_response();
    }
    let task = PrioritizedTask::new(TaskType::FullRebuild, TARGET_GRAPH, REBUILD_PRIORITY);
    let response = enqueue_task(&state, task).await;
    (StatusCode::ACCEPTED, Json(response)).into_response()
}
