//! The nine-stage listing pipeline: stage handlers, the shared application
//! state they run against, and the worker pool that drains the queue.
//!
//! Each handler is a function `(state, entity_id) -> StageOutcome` with no
//! hidden control flow: it loads what it needs, persists its results together
//! with the next stage's job in one transaction, and returns. Re-running a
//! handler on unchanged state is a no-op.

pub mod dedupe;
pub mod normalize;
pub mod parse;
pub mod price;
pub mod risk;
pub mod score;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::config::Config;
use crate::delivery::transport::MessagingTransport;
use crate::delivery::{channel, notify};
use crate::llm::LlmTransport;
use crate::pipeline::parse::ExtractorRegistry;
use crate::queue::{Job, Stage, StageOutcome};
use crate::store::Store;

/// Application state shared across all workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub blob: Arc<dyn BlobStore>,
    pub llm: Arc<dyn LlmTransport>,
    pub messenger: Arc<dyn MessagingTransport>,
    pub extractors: Arc<ExtractorRegistry>,
}

/// Dispatch one job to its stage handler under the stage deadline.
pub async fn handle_job(state: &AppState, job: &Job) -> StageOutcome {
    let deadline = Duration::from_secs(state.config.stage_deadline_secs);
    let result = tokio::time::timeout(deadline, run_stage(state, job)).await;
    match result {
        Err(_) => StageOutcome::Retry(format!(
            "stage {} exceeded {}s deadline",
            job.stage.as_str(),
            deadline.as_secs()
        )),
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            // handler errors are transient by default; invariant violations
            // come back as explicit DeadLetter from the handlers themselves
            warn!(
                stage = job.stage.as_str(),
                entity = %job.entity_id,
                error = %e,
                "Stage handler failed"
            );
            StageOutcome::Retry(format!("{e:#}"))
        }
    }
}

async fn run_stage(state: &AppState, job: &Job) -> anyhow::Result<StageOutcome> {
    match job.stage {
        Stage::Parse => parse::run(state, &job.entity_id).await,
        Stage::Normalize => normalize::run(state, &job.entity_id).await,
        Stage::Dedupe => dedupe::run(state, &job.entity_id).await,
        Stage::Price => price::run(state, &job.entity_id).await,
        Stage::Risk => risk::run(state, &job.entity_id).await,
        Stage::Score => score::run(state, &job.entity_id).await,
        Stage::Channel => channel::run(state, &job.entity_id).await,
        Stage::AlertMatch => crate::delivery::alerts::run(state, &job.entity_id).await,
        Stage::Notify => notify::run(state, &job.entity_id).await,
    }
}

/// Spawn the worker pool plus a maintenance task. Workers exit when the
/// shutdown flag flips.
pub fn spawn_workers(state: AppState, mut shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let fanout = state.config.worker_fanout.max(1);
    info!(workers = fanout, "Starting pipeline workers");

    for worker_id in 0..fanout {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let lease_secs = (state.config.stage_deadline_secs * 2) as i64;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let job = match state.store.dequeue_job(lease_secs) {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                            _ = shutdown.changed() => {}
                        }
                        continue;
                    }
                    Err(e) => {
                        error!(worker = worker_id, error = %e, "Dequeue failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                debug!(
                    worker = worker_id,
                    stage = job.stage.as_str(),
                    entity = %job.entity_id,
                    attempt = job.attempts,
                    "Processing job"
                );
                let outcome = handle_job(&state, &job).await;
                if let Err(e) = state
                    .store
                    .finish_job(&job, outcome, state.config.max_attempts)
                {
                    error!(worker = worker_id, error = %e, "Failed to settle job");
                }
            }
        }));
    }

    // maintenance: reap expired leases, purge old finished jobs, watch depth
    {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if let Err(e) = state.store.reap_expired_leases() {
                    error!(error = %e, "Lease reaper failed");
                }
                let _ = state.store.purge_finished_jobs(7 * 86_400);
                for stage in [Stage::Dedupe, Stage::Price] {
                    if let Ok(depth) = state.store.queue_depth(stage) {
                        if depth > 1000 {
                            warn!(stage = stage.as_str(), depth, "Queue depth high");
                        }
                    }
                }
            }
        }));
    }

    handles
}

/// Drain the queue synchronously until it is empty. Test and backfill
/// helper: deterministic, single-threaded, no sleeping.
pub async fn drain_queue(state: &AppState) -> anyhow::Result<usize> {
    let lease_secs = (state.config.stage_deadline_secs * 2) as i64;
    let mut processed = 0;
    while let Some(job) = state.store.dequeue_job(lease_secs)? {
        let outcome = handle_job(state, &job).await;
        state
            .store
            .finish_job(&job, outcome, state.config.max_attempts)?;
        processed += 1;
        if processed > 100_000 {
            anyhow::bail!("drain_queue runaway");
        }
    }
    Ok(processed)
}
