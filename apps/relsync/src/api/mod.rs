//! # Operations Endpoint
//!
//! A small HTTP surface over the running daemon, built with axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Queue depth, convergence lag, graph size, pending tasks
//! - `POST /trigger/sweep` - Queue a comparison sweep
//! - `POST /trigger/rebuild` - Queue a full rebuild from the configured export
//!
//! Triggers only queue work in the scheduler's task queue and wake the
//! daemon loop; they never run a sweep or a rebuild on the request path.

mod handlers;
mod types;

// Re-export handlers and types for integration tests (via `relsync::api::*`)
pub use handlers::{health_handler, rebuild_handler, status_handler, sweep_handler};
pub use types::{ErrorResponse, HealthResponse, StatusResponse, TriggerResponse};

use crate::pipeline::Pipeline;
use axum::{
    Router,
    routing::{get, post},
};
use relsync_core::{SyncError, TaskQueue};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Scheduler bookkeeping shared by the daemon loop and the endpoint.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub tasks: TaskQueue,
    pub last_sweep: Option<Instant>,
    pub last_rebuild: Option<Instant>,
}

impl SchedulerState {
    pub fn last_sweep_age_secs(&self) -> Option<u64> {
        self.last_sweep.map(|at| at.elapsed().as_secs())
    }

    pub fn last_rebuild_age_secs(&self) -> Option<u64> {
        self.last_rebuild.map(|at| at.elapsed().as_secs())
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub scheduler: Arc<Mutex<SchedulerState>>,
    /// Wakes the daemon loop when a task is queued.
    pub wake: Arc<Notify>,
    /// Whether a rebuild input is configured.
    pub rebuild_enabled: bool,
}

impl AppState {
    #[must_use]
    pub fn new(pipeline: Pipeline, rebuild_enabled: bool) -> Self {
        Self {
            pipeline,
            scheduler: Arc::new(Mutex::new(SchedulerState::default())),
            wake: Arc::new(Notify::new()),
            rebuild_enabled,
        }
    }
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/trigger/sweep", post(handlers::sweep_handler))
        .route("/trigger/rebuild", post(handlers::rebuild_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve the endpoint on `addr` until the process exits.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), SyncError> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SyncError::Io(format!("Bind failed: {}", e)))?;

    tracing::info!("relsync operations endpoint listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| SyncError::Io(format!("Server error: {}", e)))
}
