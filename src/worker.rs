//! Queue worker loop.
//!
//! Leases tasks round-robin from every pipeline queue and routes each one
//! through [`stages::handle`]. The outcome decides what happens to the task:
//!
//! | Outcome | Action |
//! |---------|--------|
//! | success | done |
//! | `PipelineError::Busy` | re-queued as is; not a failed delivery |
//! | rejection (not allowed, missing kind, malformed) | dropped with an error log |
//! | any other error | re-queued with `retry_count + 1`, dropped past the limit |
//!
//! The lease is acknowledged only after the outcome is settled, including
//! any re-enqueue. A worker that dies before that leaves the task to be
//! redelivered once the lease expires.

use std::time::Duration;

use anyhow::Result;

use autotown_core::queue::{Lease, Task};
use autotown_core::stages::{self, StageOutcome};
use autotown_core::{PipelineError, Services};

use crate::config::WorkerConfig;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Stop after this many deliveries.
    pub max_tasks: Option<usize>,
    pub max_task_retries: u32,
    pub idle_exit: bool,
    pub poll_interval: Duration,
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig, max_tasks: Option<usize>) -> Self {
        Self {
            max_tasks,
            max_task_retries: config.max_task_retries,
            idle_exit: config.idle_exit,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkReport {
    pub delivered: usize,
    pub succeeded: usize,
    pub deferred: usize,
    pub retried: usize,
    pub rejected: usize,
    pub dropped: usize,
}

enum Disposition {
    Done,
    Deferred,
    Retry,
    Rejected,
    Dropped,
}

fn describe(outcome: &StageOutcome) {
    match outcome {
        StageOutcome::Paged(r) => tracing::info!(
            keys = r.keys,
            tasks = r.dispatched.tasks,
            finished = r.finished,
            "map page done"
        ),
        StageOutcome::Destroyed(n) => tracing::info!(deleted = n, "destroy done"),
        StageOutcome::LoggedKeys(n) => tracing::debug!(keys = n, "logkeys done"),
        StageOutcome::Reprocessed(r) => {
            tracing::info!(queued = r.queued, skipped = r.skipped, "processUsage done")
        }
        StageOutcome::Stored(r) | StageOutcome::RolledUp(r) => tracing::debug!(
            identities = r.identities,
            updated = r.updated,
            created = r.created.len(),
            "rollup done"
        ),
        StageOutcome::Counted(r) => tracing::info!(
            counted = r.counted,
            skipped = r.skipped,
            buckets = r.buckets,
            "countUsage done"
        ),
    }
}

async fn deliver(svc: &Services, queue: &str, task: Task, max_retries: u32) -> Result<Disposition> {
    let err = match stages::handle(svc, &task).await {
        Ok(outcome) => {
            describe(&outcome);
            return Ok(Disposition::Done);
        }
        Err(err) => err,
    };

    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Busy { .. }) => {
            tracing::debug!(queue, path = %task.path, "too many jobs queued, backing off");
            svc.queue.enqueue(queue, task).await?;
            return Ok(Disposition::Deferred);
        }
        Some(pe) if pe.is_rejection() => {
            tracing::error!(queue, path = %task.path, error = %pe, "task rejected");
            return Ok(Disposition::Rejected);
        }
        _ => {}
    }

    let mut task = task;
    task.retry_count += 1;
    if task.retry_count > max_retries {
        tracing::error!(
            queue,
            path = %task.path,
            attempts = task.retry_count,
            error = %format!("{err:#}"),
            "task failed permanently, dropping"
        );
        return Ok(Disposition::Dropped);
    }
    tracing::warn!(
        queue,
        path = %task.path,
        retry_count = task.retry_count,
        error = %format!("{err:#}"),
        "task failed, will retry"
    );
    svc.queue.enqueue(queue, task).await?;
    Ok(Disposition::Retry)
}

/// Drain the pipeline queues.
///
/// Returns when every queue is empty (with `idle_exit`), when `max_tasks`
/// deliveries have been made, or when a queue backend fails.
pub async fn run_worker(svc: &Services, options: &WorkerOptions) -> Result<WorkReport> {
    let queues: Vec<String> = svc.queues.all().iter().map(|q| q.to_string()).collect();
    let mut report = WorkReport::default();

    loop {
        let mut idle = true;
        for queue in &queues {
            if options.max_tasks.is_some_and(|max| report.delivered >= max) {
                return Ok(report);
            }
            let Some(Lease { id, task }) = svc.queue.pop(queue).await? else {
                continue;
            };
            idle = false;
            report.delivered += 1;
            let disposition = if task.retry_count > options.max_task_retries {
                tracing::error!(
                    queue,
                    path = %task.path,
                    attempts = task.retry_count,
                    "task redelivered too often, dropping"
                );
                Disposition::Dropped
            } else {
                deliver(svc, queue, task, options.max_task_retries).await?
            };
            svc.queue.ack(queue, id).await?;
            match disposition {
                Disposition::Done => report.succeeded += 1,
                Disposition::Deferred => report.deferred += 1,
                Disposition::Retry => report.retried += 1,
                Disposition::Rejected => report.rejected += 1,
                Disposition::Dropped => report.dropped += 1,
            }
        }

        if idle {
            if options.idle_exit {
                return Ok(report);
            }
            tokio::time::sleep(options.poll_interval).await;
        }
    }
}
