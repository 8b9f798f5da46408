//! # Daemon
//!
//! The long-running service: an optional live feed into the coalescer, the
//! operations endpoint, and a scheduler loop.
//!
//! Every tick the loop snapshots [`SystemState`], lets the policy propose
//! tasks, merges them into the shared [`TaskQueue`] (where endpoint
//! triggers also land) and runs queued tasks until it is empty. Task
//! failures are logged and left to the next tick; only a failure to start
//! the endpoint ends the daemon.

use crate::api::{self, AppState};
use crate::config::Config;
use crate::feed;
use crate::pipeline::Pipeline;
use relsync_core::{
    Coalescer, DefaultPolicy, PrioritizedTask, SchedulerPolicy, SyncError, SystemState, TaskType,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Scheduler tick.
const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// Daemon settings taken from configuration.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub tick: Duration,
    pub sweep_batch: usize,
    pub bulk_input: Option<PathBuf>,
    pub bulk_output: PathBuf,
    pub bulk: relsync_core::BulkConfig,
}

impl DaemonSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: DEFAULT_TICK,
            sweep_batch: config.sweep.batch_size,
            bulk_input: config.bulk.input.clone(),
            bulk_output: config.bulk.output.clone(),
            bulk: config.bulk_config(),
        }
    }
}

/// Scheduler driver.
pub struct Daemon<P: SchedulerPolicy = DefaultPolicy> {
    state: AppState,
    policy: P,
    settings: DaemonSettings,
}

impl Daemon<DefaultPolicy> {
    pub fn from_config(pipeline: Pipeline, config: &Config) -> Self {
        let settings = DaemonSettings::from_config(config);
        let state = AppState::new(pipeline, settings.bulk_input.is_some());
        Self::new(state, DefaultPolicy::new(config.sweep.interval_secs), settings)
    }
}

impl<P: SchedulerPolicy> Daemon<P> {
    pub fn new(state: AppState, policy: P, settings: DaemonSettings) -> Self {
        Self {
            state,
            policy,
            settings,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run until Ctrl+C.
    pub async fn run(self, bind: &str, feed_addr: Option<String>) -> Result<(), SyncError> {
        let server = tokio::spawn({
            let state = self.state.clone();
            let bind = bind.to_string();
            async move { api::run_server(&bind, state).await }
        });

        if let Some(addr) = feed_addr {
            let queue = self.state.pipeline.queue().clone();
            let registry = self.state.pipeline.reconciler().registry().clone();
            let wake = self.state.wake.clone();
            tokio::spawn(async move {
                let mut coalescer = Coalescer::new(queue, registry);
                match feed::run_tcp(&addr, &mut coalescer).await {
                    Ok(_) => tracing::warn!(addr = %addr, "live feed closed; relying on sweeps"),
                    Err(e) => tracing::error!(addr = %addr, error = %e, "live feed failed; relying on sweeps"),
                }
                wake.notify_one();
            });
        }

        let mut interval = tokio::time::interval(self.settings.tick);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = interval.tick() => {}
                _ = self.state.wake.notified() => {}
            }
            if server.is_finished() {
                return match server.await {
                    Ok(result) => result,
                    Err(e) => Err(SyncError::Io(format!("endpoint task: {e}"))),
                };
            }
            self.tick().await;
        }
        server.abort();
        Ok(())
    }

    /// One scheduler round: evaluate, merge, run everything queued.
    pub async fn tick(&self) -> usize {
        match self.system_state().await {
            Ok(system) => {
                let proposals = self.policy.evaluate(&system);
                let mut scheduler = self.state.scheduler.lock().await;
                scheduler.tasks.merge(proposals);
            }
            Err(e) => tracing::warn!(error = %e, "could not read system state"),
        }

        let mut ran = 0;
        loop {
            let next = self.state.scheduler.lock().await.tasks.pop();
            let Some(task) = next else {
                return ran;
            };
            ran += 1;
            if let Err(e) = self.run_task(&task).await {
                tracing::error!(task = %task.task_type, error = %e, "task failed");
            }
        }
    }

    async fn system_state(&self) -> Result<SystemState, SyncError> {
        let queue = self.state.pipeline.queue_stats()?;
        let graph_empty = self.state.pipeline.graph().read().await.node_count()? == 0;
        let (last_sweep_age_secs, last_rebuild_age_secs) = {
            let scheduler = self.state.scheduler.lock().await;
            (
                scheduler.last_sweep_age_secs(),
                scheduler.last_rebuild_age_secs(),
            )
        };
        Ok(SystemState {
            queue_depth: queue.depth,
            last_sweep_age_secs,
            last_rebuild_age_secs,
            graph_empty,
            failing_keys: queue.failing_keys,
        })
    }

    async fn run_task(&self, task: &PrioritizedTask) -> Result<(), SyncError> {
        let pipeline = &self.state.pipeline;
        match task.task_type {
            TaskType::ProcessQueue => {
                pipeline.drain_all().await?;
            }
            TaskType::Sweep => {
                let report = pipeline.sweep_once(self.settings.sweep_batch).await;
                self.state.scheduler.lock().await.last_sweep = Some(Instant::now());
                let report = report?;
                if !report.is_complete() {
                    tracing::warn!(
                        failed_batches = report.failed_batches,
                        "sweep incomplete; skipped batches wait for the next sweep"
                    );
                }
            }
            TaskType::FullRebuild => {
                let Some(input) = &self.settings.bulk_input else {
                    tracing::debug!("rebuild proposed but bulk.input is not set; skipping");
                    return Ok(());
                };
                let rebuild = pipeline
                    .rebuild(input, &self.settings.bulk_output, self.settings.bulk.clone())
                    .await;
                self.state.scheduler.lock().await.last_rebuild = Some(Instant::now());
                let rebuild = rebuild?;
                if rebuild.load.is_none() {
                    return Err(SyncError::Io(format!(
                        "bulk extraction of {} incomplete; graph not loaded",
                        input.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
