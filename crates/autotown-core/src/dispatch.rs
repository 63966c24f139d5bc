//! Chunked, concurrent task fan-out.
//!
//! Keys are split into chunks of at most `chunk_size`, each chunk becomes one
//! task carrying a compressed key list, and the tasks are submitted in
//! [`MAX_BATCH`]-sized `enqueue_multi` calls running concurrently. Every
//! submission runs to completion; if any failed the dispatch as a whole
//! fails so the caller's page is retried.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};

use crate::codec;
use crate::error::PipelineError;
use crate::models::Key;
use crate::queue::{Task, WorkQueue, MAX_BATCH};

/// Outcome of a successful [`dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub keys: usize,
    pub tasks: usize,
    pub batches: usize,
}

/// Build one task per chunk of keys, in key order.
pub fn build_tasks(path: &str, keys: &[Key], chunk_size: usize) -> Result<Vec<Task>> {
    let chunk_size = chunk_size.clamp(1, MAX_BATCH);
    keys.chunks(chunk_size)
        .map(|chunk| {
            let payload = codec::encode_keys(chunk).context("encoding key chunk")?;
            Ok(Task::with_payload(path, payload))
        })
        .collect()
}

/// Submit `tasks` in [`MAX_BATCH`]-sized calls, `concurrency` at a time.
///
/// Returns the number of batches. Every batch is attempted; the first
/// failure is reported along with the failure count.
pub async fn submit_batches(
    queue: &dyn WorkQueue,
    queue_name: &str,
    tasks: Vec<Task>,
    concurrency: usize,
) -> Result<usize> {
    let batches: Vec<Vec<Task>> = tasks.chunks(MAX_BATCH).map(<[Task]>::to_vec).collect();
    let total = batches.len();

    let results: Vec<_> = stream::iter(batches)
        .map(|batch| async move { queue.enqueue_multi(queue_name, batch).await })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.err().map(|e| e.to_string()))
        .collect();
    if let Some(first) = errors.first() {
        tracing::error!(
            queue = queue_name,
            failed = errors.len(),
            total,
            error = %first,
            "task submission failed"
        );
        return Err(PipelineError::Dispatch {
            failed: errors.len(),
            total,
            first: first.clone(),
        }
        .into());
    }
    Ok(total)
}

pub async fn dispatch(
    queue: &dyn WorkQueue,
    queue_name: &str,
    path: &str,
    keys: &[Key],
    chunk_size: usize,
    concurrency: usize,
) -> Result<DispatchReport> {
    if keys.is_empty() {
        return Ok(DispatchReport::default());
    }

    let tasks = build_tasks(path, keys, chunk_size)?;
    let task_count = tasks.len();
    let batches = submit_batches(queue, queue_name, tasks, concurrency).await?;

    tracing::debug!(queue = queue_name, path, keys = keys.len(), tasks = task_count, "dispatched");
    Ok(DispatchReport {
        keys: keys.len(),
        tasks: task_count,
        batches,
    })
}
