//! In-memory [`WorkQueue`] for tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Lease, QueueError, QueueStats, Task, WorkQueue, DEFAULT_LEASE, MAX_BATCH};

struct Entry {
    id: i64,
    task: Task,
    leased_until: Option<Instant>,
}

#[derive(Default)]
struct Queues {
    next_id: i64,
    by_name: HashMap<String, VecDeque<Entry>>,
}

struct Shared {
    queues: Mutex<Queues>,
    lease: Duration,
    /// Number of upcoming submissions to fail.
    injected_failures: AtomicU32,
}

#[derive(Clone)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                lease,
                injected_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `n` enqueue calls fail with a backend error.
    pub fn inject_failures(&self, n: u32) {
        self.shared.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Remove and return every unacknowledged task on `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Task> {
        self.shared
            .queues
            .lock()
            .ok()
            .and_then(|mut q| {
                q.by_name
                    .get_mut(queue)
                    .map(|d| d.drain(..).map(|e| e.task).collect())
            })
            .unwrap_or_default()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .ok()
            .and_then(|q| q.by_name.get(queue).map(VecDeque::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Queues>, QueueError> {
        self.shared
            .queues
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.shared
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn push(&self, queue: &str, tasks: Vec<Task>) -> Result<(), QueueError> {
        if self.take_injected_failure() {
            return Err(QueueError::Backend("injected failure".to_string()));
        }
        let mut queues = self.lock()?;
        let Queues { next_id, by_name } = &mut *queues;
        let entries = by_name.entry(queue.to_string()).or_default();
        for task in tasks {
            *next_id += 1;
            entries.push_back(Entry {
                id: *next_id,
                task,
                leased_until: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(&self, queue: &str, task: Task) -> Result<(), QueueError> {
        self.push(queue, vec![task])
    }

    async fn enqueue_multi(&self, queue: &str, tasks: Vec<Task>) -> Result<(), QueueError> {
        if tasks.len() > MAX_BATCH {
            return Err(QueueError::TooManyTasks { count: tasks.len() });
        }
        self.push(queue, tasks)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            tasks: self.pending(queue),
        })
    }

    async fn pop(&self, queue: &str) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut queues = self.lock()?;
        let Some(entries) = queues.by_name.get_mut(queue) else {
            return Ok(None);
        };
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.leased_until.map_or(true, |until| until <= now))
        else {
            return Ok(None);
        };
        if entry.leased_until.is_some() {
            entry.task.retry_count += 1;
            tracing::warn!(queue, id = entry.id, "lease expired, redelivering task");
        }
        entry.leased_until = Some(now + self.shared.lease);
        Ok(Some(Lease {
            id: entry.id,
            task: entry.task.clone(),
        }))
    }

    async fn ack(&self, queue: &str, id: i64) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        if let Some(entries) = queues.by_name.get_mut(queue) {
            entries.retain(|e| e.id != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_multi_enforces_batch_limit() {
        let q = InMemoryQueue::new();
        let tasks = vec![Task::with_payload("/x", vec![]); MAX_BATCH + 1];
        let err = q.enqueue_multi("work", tasks).await.unwrap_err();
        assert!(matches!(err, QueueError::TooManyTasks { count: 101 }));
        assert_eq!(q.pending("work"), 0);
    }

    #[tokio::test]
    async fn test_fifo_per_queue() {
        let q = InMemoryQueue::new();
        q.enqueue("a", Task::with_payload("/1", vec![])).await.unwrap();
        q.enqueue("a", Task::with_payload("/2", vec![])).await.unwrap();
        q.enqueue("b", Task::with_payload("/3", vec![])).await.unwrap();
        assert_eq!(q.stats("a").await.unwrap().tasks, 2);
        assert_eq!(q.pop("a").await.unwrap().unwrap().task.path, "/1");
        assert_eq!(q.pop("a").await.unwrap().unwrap().task.path, "/2");
        assert!(q.pop("a").await.unwrap().is_none());
        assert_eq!(q.pending("b"), 1);
    }

    #[tokio::test]
    async fn test_leased_task_is_hidden_until_acked() {
        let q = InMemoryQueue::new();
        q.enqueue("a", Task::with_payload("/1", vec![])).await.unwrap();
        let lease = q.pop("a").await.unwrap().unwrap();
        assert!(q.pop("a").await.unwrap().is_none());
        assert_eq!(q.pending("a"), 1);

        q.ack("a", lease.id).await.unwrap();
        assert_eq!(q.pending("a"), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let q = InMemoryQueue::with_lease(Duration::ZERO);
        q.enqueue("a", Task::with_payload("/1", vec![])).await.unwrap();
        let first = q.pop("a").await.unwrap().unwrap();
        assert_eq!(first.task.retry_count, 0);

        let again = q.pop("a").await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.task.path, "/1");
        assert_eq!(again.task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let q = InMemoryQueue::new();
        q.inject_failures(1);
        assert!(q.enqueue("a", Task::default()).await.is_err());
        assert!(q.enqueue("a", Task::default()).await.is_ok());
    }
}
