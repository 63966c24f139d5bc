//! Queue-depth admission control for the paginator.

use anyhow::Result;

use crate::error::PipelineError;
use crate::queue::WorkQueue;

/// Refuse new work while `queue` holds `threshold` or more pending tasks.
///
/// A failure to read queue statistics counts as saturation.
pub async fn admit(queue: &dyn WorkQueue, name: &str, threshold: usize) -> Result<()> {
    let pending = match queue.stats(name).await {
        Ok(stats) => stats.tasks,
        Err(e) => {
            tracing::warn!(queue = name, error = %e, "queue stats unavailable, treating as busy");
            usize::MAX
        }
    };
    if pending >= threshold {
        tracing::info!(queue = name, pending, threshold, "queue saturated");
        return Err(PipelineError::Busy {
            queue: name.to_string(),
            pending,
            threshold,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::{Lease, QueueError, QueueStats, Task};
    use async_trait::async_trait;

    struct BrokenQueue;

    #[async_trait]
    impl WorkQueue for BrokenQueue {
        async fn enqueue(&self, _: &str, _: Task) -> Result<(), QueueError> {
            Err(QueueError::Backend("down".into()))
        }
        async fn enqueue_multi(&self, _: &str, _: Vec<Task>) -> Result<(), QueueError> {
            Err(QueueError::Backend("down".into()))
        }
        async fn stats(&self, _: &str) -> Result<QueueStats, QueueError> {
            Err(QueueError::Backend("down".into()))
        }
        async fn pop(&self, _: &str) -> Result<Option<Lease>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &str, _: i64) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_admits_below_threshold() {
        let q = InMemoryQueue::new();
        for _ in 0..2 {
            q.enqueue("map2", Task::default()).await.unwrap();
        }
        assert!(admit(&q, "map2", 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_refuses_at_threshold() {
        let q = InMemoryQueue::new();
        for _ in 0..3 {
            q.enqueue("map2", Task::default()).await.unwrap();
        }
        let err = admit(&q, "map2", 3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Busy { pending: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_stats_failure_is_busy() {
        let err = admit(&BrokenQueue, "map2", 1000).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Busy { .. })
        ));
    }
}
