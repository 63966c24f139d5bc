//! Work queue abstraction.
//!
//! A [`Task`] names a processing path and carries either a binary payload
//! (a compressed key chunk or envelope) or form-style parameters (paginator
//! jobs). Delivery is at-least-once: consumers must be idempotent.
//!
//! [`WorkQueue::pop`] leases a task rather than removing it. The consumer
//! calls [`WorkQueue::ack`] once the task is handled; a lease that runs out
//! first puts the task back in line with its `retry_count` bumped, so a
//! worker that dies mid-task loses nothing.

pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Maximum number of tasks accepted by one [`WorkQueue::enqueue_multi`] call.
pub const MAX_BATCH: usize = 100;

/// How long a popped task stays invisible before it is redelivered.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("batch of {count} tasks exceeds the limit of {MAX_BATCH}")]
    TooManyTasks { count: usize },
    #[error("queue backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub path: String,
    pub payload: Vec<u8>,
    pub params: BTreeMap<String, String>,
    /// Number of failed or abandoned deliveries so far.
    pub retry_count: u32,
}

impl Task {
    pub fn with_payload(path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_params(path: impl Into<String>, params: BTreeMap<String, String>) -> Self {
        Self {
            path: path.into(),
            params,
            ..Default::default()
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// A popped task, held until acknowledged or until the lease runs out.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: i64,
    pub task: Task,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks not yet acknowledged, leased or not.
    pub tasks: usize,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, task: Task) -> Result<(), QueueError>;

    /// Enqueue up to [`MAX_BATCH`] tasks in one call.
    async fn enqueue_multi(&self, queue: &str, tasks: Vec<Task>) -> Result<(), QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Lease the next deliverable task, if any. Used by the worker loop.
    async fn pop(&self, queue: &str) -> Result<Option<Lease>, QueueError>;

    /// Remove a leased task for good. Acking an unknown id is a no-op.
    async fn ack(&self, queue: &str, id: i64) -> Result<(), QueueError>;
}
