//! Queue task handlers wiring the stages together.
//!
//! Every handler is a stateless unit of work over one task. [`handle`]
//! routes a task to its handler by path; the worker loop owns retries.
//!
//! | Path | Payload | Handler |
//! |------|---------|---------|
//! | `/batch/map` | params `kind`, `next`, `cursor` | [`paginate::batch_map`] |
//! | `/batch/destroy` | key chunk | [`destroy::destroy`] |
//! | `/batch/logkeys` | key chunk | [`log_keys`] |
//! | `/batch/processUsage` | `UsageStat` key chunk | [`process_usage`] |
//! | `/batch/asyncUsageStats` | envelope | [`async_usage_stats`] |
//! | `/batch/asyncRollup` | envelope | [`async_rollup`] |
//! | `/batch/countUsage` | `FoundController` key chunk | [`counter::count_usage`] |

use anyhow::{Context, Result};
use serde_json::Value;

use crate::codec;
use crate::context::Services;
use crate::counter::{self, CountReport};
use crate::destroy;
use crate::dispatch;
use crate::error::PipelineError;
use crate::merge::{self, MergeReport};
use crate::models::{Key, UsageEnvelope, UsageStat, KIND_USAGE_STAT};
use crate::paginate::{self, MapRequest, PageReport};
use crate::queue::Task;
use crate::recent::{self, RecentUsage};
use crate::sighting;
use crate::store::{from_entity, to_entity, StoreError};

pub const PATH_MAP: &str = "/batch/map";
pub const PATH_DESTROY: &str = "/batch/destroy";
pub const PATH_LOG_KEYS: &str = "/batch/logkeys";
pub const PATH_PROCESS_USAGE: &str = "/batch/processUsage";
pub const PATH_ASYNC_USAGE_STATS: &str = "/batch/asyncUsageStats";
pub const PATH_ASYNC_ROLLUP: &str = "/batch/asyncRollup";
pub const PATH_COUNT_USAGE: &str = "/batch/countUsage";

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Paged(PageReport),
    Destroyed(usize),
    LoggedKeys(usize),
    Reprocessed(ReprocessReport),
    Stored(MergeReport),
    RolledUp(MergeReport),
    Counted(CountReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessReport {
    pub queued: usize,
    pub skipped: usize,
}

fn malformed(e: anyhow::Error) -> PipelineError {
    PipelineError::Malformed(format!("{e:#}"))
}

fn decode_keys(payload: &[u8]) -> Result<Vec<Key>, PipelineError> {
    codec::decode_keys(payload).map_err(malformed)
}

fn decode_envelope(payload: &[u8]) -> Result<UsageEnvelope, PipelineError> {
    codec::decode_envelope(payload).map_err(malformed)
}

/// Route one task to its handler.
pub async fn handle(svc: &Services, task: &Task) -> Result<StageOutcome> {
    let outcome = match task.path.as_str() {
        PATH_MAP => {
            let request = MapRequest::from_task(task)?;
            StageOutcome::Paged(paginate::batch_map(svc, &request).await?)
        }
        PATH_DESTROY => StageOutcome::Destroyed(destroy::destroy(svc.store.as_ref(), &task.payload).await?),
        PATH_LOG_KEYS => StageOutcome::LoggedKeys(log_keys(&task.payload)?),
        PATH_PROCESS_USAGE => StageOutcome::Reprocessed(process_usage(svc, &task.payload).await?),
        PATH_ASYNC_USAGE_STATS => StageOutcome::Stored(async_usage_stats(svc, &task.payload).await?),
        PATH_ASYNC_ROLLUP => StageOutcome::RolledUp(async_rollup(svc, &task.payload).await?),
        PATH_COUNT_USAGE => {
            let keys = decode_keys(&task.payload)?;
            StageOutcome::Counted(counter::count_usage(svc, keys).await?)
        }
        other => {
            return Err(PipelineError::Malformed(format!("no handler for path {other}")).into());
        }
    };
    Ok(outcome)
}

/// Accept a usage submission: queue its envelope for storage and rollup.
pub async fn accept_usage(svc: &Services, envelope: &UsageEnvelope) -> Result<()> {
    let payload = codec::encode_envelope(envelope)?;
    svc.queue
        .enqueue(
            &svc.queues.usage,
            Task::with_payload(PATH_ASYNC_USAGE_STATS, payload),
        )
        .await
        .context("queueing usage submission")?;
    Ok(())
}

pub fn log_keys(payload: &[u8]) -> Result<usize> {
    let keys = decode_keys(payload)?;
    tracing::debug!(keys = keys.len(), "got keys to process");
    for key in &keys {
        tracing::debug!(key = %key);
    }
    Ok(keys.len())
}

/// Merge the sightings of one submission.
///
/// A payload without a usable shape is logged and contributes nothing.
pub async fn rollup(svc: &Services, envelope: &UsageEnvelope) -> Result<MergeReport> {
    let sightings = match sighting::extract(envelope, &svc.aliases) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(ip = %envelope.ip, timestamp = %envelope.timestamp, error = %e, "couldn't parse usage payload");
            return Ok(MergeReport::default());
        }
    };
    merge::merge_sightings(svc, sightings).await
}

pub async fn async_rollup(svc: &Services, payload: &[u8]) -> Result<MergeReport> {
    let envelope = decode_envelope(payload)?;
    rollup(svc, &envelope).await.context("doing async rollup")
}

/// Persist a submission as a compressed [`UsageStat`].
///
/// The key is derived from the submission fingerprint, so redelivery
/// overwrites rather than duplicates.
pub async fn store_usage(svc: &Services, envelope: &UsageEnvelope) -> Result<Key> {
    let raw = serde_json::to_vec(&envelope.raw_data)?;
    let data = codec::gz(&raw)?;
    tracing::debug!(from = raw.len(), to = data.len(), "compressed usage data");
    let stat = UsageStat {
        data,
        timestamp: envelope.timestamp,
        addr: envelope.ip.clone(),
        country: envelope.country.clone(),
        region: envelope.region.clone(),
        city: envelope.city.clone(),
        lat: envelope.lat,
        lon: envelope.lon,
        key: None,
    };
    let key = Key::new(KIND_USAGE_STAT, sighting::fingerprint(envelope));
    svc.store
        .put(&key, to_entity(&stat)?)
        .await
        .context("storing usage data")?;
    Ok(key)
}

/// Roll up, store and record a submission concurrently.
///
/// Rollup and storage must both succeed; the recent-usage window is
/// best-effort.
#[tracing::instrument(skip_all)]
pub async fn async_usage_stats(svc: &Services, payload: &[u8]) -> Result<MergeReport> {
    let envelope = decode_envelope(payload)?;
    let entry = RecentUsage::from_envelope(&envelope, &svc.aliases);

    let durable = futures::future::try_join(rollup(svc, &envelope), store_usage(svc, &envelope));
    let window = recent::append(svc.cache.as_ref(), entry, svc.settings.recent_limit);
    let (durable, window) = futures::join!(durable, window);

    if let Err(e) = window {
        tracing::info!(error = %e, "couldn't update recent usage");
    }
    let (report, key) = durable?;
    tracing::debug!(key = %key, updated = report.updated, "stored usage");
    Ok(report)
}

fn restore_envelope(stat: UsageStat) -> Result<UsageEnvelope> {
    let raw = codec::ungz(&stat.data)?;
    let raw_data: Value = serde_json::from_slice(&raw).context("stored usage is not JSON")?;
    Ok(UsageEnvelope::from_stat(&stat, raw_data))
}

/// Reload stored submissions and fan them out to the rollup queue.
#[tracing::instrument(skip_all)]
pub async fn process_usage(svc: &Services, payload: &[u8]) -> Result<ReprocessReport> {
    let keys = decode_keys(payload)?;
    tracing::debug!(keys = keys.len(), "got keys to process");

    let results = svc
        .store
        .get_multi(&keys)
        .await
        .context("fetching usage stats")?;

    let mut report = ReprocessReport::default();
    let mut tasks = Vec::new();
    for (key, result) in keys.iter().zip(results) {
        let envelope = result
            .map_err(anyhow::Error::from)
            .and_then(|entity| Ok(from_entity::<UsageStat>(entity)?))
            .and_then(restore_envelope)
            .and_then(|envelope| codec::encode_envelope(&envelope));
        match envelope {
            Ok(payload) => tasks.push(Task::with_payload(PATH_ASYNC_ROLLUP, payload)),
            Err(e) => {
                if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound)) {
                    tracing::warn!(key = %key, "usage stat missing");
                } else {
                    tracing::warn!(key = %key, error = %e, "failed to restore usage record");
                }
                report.skipped += 1;
            }
        }
    }

    report.queued = tasks.len();
    dispatch::submit_batches(
        svc.queue.as_ref(),
        &svc.queues.rollup,
        tasks,
        svc.settings.concurrency,
    )
    .await?;
    tracing::debug!(queued = report.queued, "queued entries for batch processing");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::cache::memory::InMemoryCache;
    use crate::merge::NoopNotifier;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::WorkQueue;
    use crate::store::memory::InMemoryStore;
    use crate::store::KeyValueStore;

    fn services(store: &InMemoryStore, queue: &InMemoryQueue, cache: &InMemoryCache) -> Services {
        Services::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            Arc::new(cache.clone()),
            Arc::new(NoopNotifier),
        )
    }

    fn envelope() -> UsageEnvelope {
        UsageEnvelope {
            ip: "9.9.9.9".to_string(),
            country: "US".to_string(),
            region: "OR".to_string(),
            city: "Portland".to_string(),
            lat: 45.5,
            lon: -122.6,
            timestamp: Utc.timestamp_opt(1_460_000_000, 0).unwrap(),
            raw_data: json!({
                "boardsSeen": [{"UUID": "dev-1", "Name": "CopterControl", "ID": 1025}],
                "currentOS": "Debian 8",
                "shareIP": "true"
            }),
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let svc = services(&InMemoryStore::new(), &InMemoryQueue::new(), &InMemoryCache::new());
        let err = handle(&svc, &Task::with_payload("/batch/nope", vec![]))
            .await
            .unwrap_err();
        let pe = err.downcast_ref::<PipelineError>().unwrap();
        assert!(pe.is_rejection());
    }

    #[tokio::test]
    async fn test_accepted_usage_flows_to_storage_and_rollup() {
        let (store, queue, cache) = (InMemoryStore::new(), InMemoryQueue::new(), InMemoryCache::new());
        let svc = services(&store, &queue, &cache);
        accept_usage(&svc, &envelope()).await.unwrap();

        let task = queue.pop("asyncusage").await.unwrap().unwrap().task;
        assert_eq!(task.path, PATH_ASYNC_USAGE_STATS);
        let outcome = handle(&svc, &task).await.unwrap();
        let StageOutcome::Stored(report) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(report.created, vec!["CC3D".to_string()]);

        // Redelivery neither duplicates the stored submission nor recounts.
        handle(&svc, &task).await.unwrap();
        assert_eq!(store.len(), 3);
        let fc: crate::models::FoundController =
            from_entity(store.get(&crate::models::FoundController::key_for("dev-1")).await.unwrap())
                .unwrap();
        assert_eq!(fc.count, 1);
        assert_eq!(fc.addr, "9.9.9.9");
        assert_eq!(recent::read(&cache, None).await.len(), 2);
    }

    #[tokio::test]
    async fn test_process_usage_requeues_stored_submissions() {
        let (store, queue, cache) = (InMemoryStore::new(), InMemoryQueue::new(), InMemoryCache::new());
        let svc = services(&store, &queue, &cache);
        let key = store_usage(&svc, &envelope()).await.unwrap();
        let missing = Key::new(KIND_USAGE_STAT, "gone");

        let payload = codec::encode_keys(&[key, missing]).unwrap();
        let report = process_usage(&svc, &payload).await.unwrap();
        assert_eq!(report, ReprocessReport { queued: 1, skipped: 1 });

        let task = queue.pop("asyncRollupBE").await.unwrap().unwrap().task;
        assert_eq!(task.path, PATH_ASYNC_ROLLUP);
        let restored = codec::decode_envelope(&task.payload).unwrap();
        assert_eq!(restored, envelope());
    }

    #[tokio::test]
    async fn test_garbage_envelope_is_malformed() {
        let svc = services(&InMemoryStore::new(), &InMemoryQueue::new(), &InMemoryCache::new());
        let err = async_rollup(&svc, b"definitely not json").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Malformed(_))
        ));
    }
}
