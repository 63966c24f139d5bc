//! Identity merge engine.
//!
//! Sightings are grouped by canonical identity, folded in memory in batch
//! order, and written back with one transactional read-modify-write per
//! identity. Identities merge concurrently and independently.
//!
//! # Fold rules
//!
//! | Field | Rule |
//! |-------|------|
//! | descriptive fields, `timestamp` | overwritten only by a strictly later sighting |
//! | `addr` | cleared unless the overwriting submission opted in |
//! | `oldest` | `min` over every folded sighting |
//! | `count` | `+1` per folded sighting |
//! | `counted` | never touched here |
//!
//! Every folded submission leaves a [`FoldMarker`] stamped with the record's
//! `epoch`, written in the same transaction as the record. A sighting whose
//! marker matches the current epoch is a replay and is skipped. Destroying
//! the record orphans its markers, since the next record gets a new epoch.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use uuid::Uuid;

use crate::context::Services;
use crate::models::{BoardSighting, FoldMarker, FoundController};
use crate::store::{from_entity, run_in_transaction, to_entity};
use crate::summary;

pub const NEW_DEVICE_SUBJECT: &str = "New Device";

/// Fire-and-forget notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Notifier that drops every message.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _subject: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}

/// Fold one sighting into the current record for its identity.
pub fn fold(existing: Option<FoundController>, sighting: &BoardSighting) -> FoundController {
    let meta = &sighting.meta;
    let Some(mut record) = existing else {
        let mut record = FoundController {
            uuid: sighting.identity.clone(),
            count: 1,
            hardware_rev: 0,
            name: String::new(),
            git_hash: String::new(),
            git_tag: String::new(),
            uavo_hash: String::new(),
            gcs_os: String::new(),
            gcs_arch: String::new(),
            gcs_version: String::new(),
            addr: String::new(),
            country: String::new(),
            region: String::new(),
            city: String::new(),
            lat: 0.0,
            lon: 0.0,
            oldest: meta.timestamp,
            timestamp: meta.timestamp,
            counted: false,
            epoch: String::new(),
            key: None,
        };
        overwrite(&mut record, sighting);
        return record;
    };

    if meta.timestamp > record.timestamp {
        overwrite(&mut record, sighting);
        record.timestamp = meta.timestamp;
    }
    record.oldest = record.oldest.min(meta.timestamp);
    record.count += 1;
    record
}

fn overwrite(record: &mut FoundController, sighting: &BoardSighting) {
    let meta = &sighting.meta;
    record.name = sighting.name.clone();
    record.hardware_rev = sighting.hardware_rev;
    record.git_hash = sighting.git_hash.clone();
    record.git_tag = sighting.git_tag.clone();
    record.uavo_hash = sighting.uavo_hash.clone();
    record.gcs_os = meta.os.clone();
    record.gcs_arch = meta.arch.clone();
    record.gcs_version = meta.version.clone();
    record.addr = if meta.share_addr {
        meta.addr.clone()
    } else {
        String::new()
    };
    record.country = meta.country.clone();
    record.region = meta.region.clone();
    record.city = meta.city.clone();
    record.lat = meta.lat;
    record.lon = meta.lon;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub identities: usize,
    /// Identities whose stored record changed.
    pub updated: usize,
    /// Display names of identities seen for the first time.
    pub created: Vec<String>,
}

struct IdentityOutcome {
    created: Option<String>,
    changed: bool,
}

async fn merge_identity(svc: &Services, identity: String, group: Vec<BoardSighting>) -> Result<IdentityOutcome> {
    let key = FoundController::key_for(&identity);
    let identity = Arc::new(identity);
    let group = Arc::new(group);
    run_in_transaction(svc.store.as_ref(), svc.settings.tx_attempts, move |tx| {
        let key = key.clone();
        let identity = Arc::clone(&identity);
        let group = Arc::clone(&group);
        Box::pin(async move {
            let existing = match tx.get(&key).await? {
                Some(entity) => Some(from_entity::<FoundController>(entity)?),
                None => None,
            };

            let mut seen = HashSet::new();
            let distinct: Vec<&BoardSighting> = group
                .iter()
                .filter(|s| seen.insert(s.meta.fingerprint.as_str()))
                .collect();
            let marker_keys: Vec<_> = distinct
                .iter()
                .map(|s| FoldMarker::key_for(&identity, &s.meta.fingerprint))
                .collect();
            let markers = tx.get_multi(&marker_keys).await?;

            let epoch = existing.as_ref().map(|r| r.epoch.clone());
            let created = existing.is_none();
            let mut record = existing;
            let mut folded = Vec::new();
            for ((sighting, marker_key), marker) in distinct.into_iter().zip(marker_keys).zip(markers) {
                let replay = match (&epoch, marker) {
                    (Some(epoch), Some(marker)) => from_entity::<FoldMarker>(marker)?.epoch == *epoch,
                    _ => false,
                };
                if replay {
                    tracing::debug!(identity = %identity, "skipping replayed submission");
                    continue;
                }
                record = Some(fold(record, sighting));
                folded.push(marker_key);
            }

            let mut record = match record {
                Some(record) if !folded.is_empty() => record,
                _ => {
                    return Ok(IdentityOutcome {
                        created: None,
                        changed: false,
                    })
                }
            };
            if record.epoch.is_empty() {
                record.epoch = Uuid::new_v4().to_string();
            }
            let marker = to_entity(&FoldMarker {
                epoch: record.epoch.clone(),
            })?;
            for marker_key in folded {
                tx.put(marker_key, marker.clone());
            }
            tx.put(key, to_entity(&record)?);
            Ok(IdentityOutcome {
                created: created.then(|| record.name.clone()),
                changed: true,
            })
        })
    })
    .await
}

/// Merge a batch of sightings into their [`FoundController`] records.
///
/// The first failing identity fails the batch; in-flight siblings are
/// dropped. A successful merge that changed anything invalidates the cached
/// usage summary, then announces new identities through the notifier. The
/// announcements are sent concurrently.
#[tracing::instrument(skip_all, fields(sightings = sightings.len()))]
pub async fn merge_sightings(svc: &Services, sightings: Vec<BoardSighting>) -> Result<MergeReport> {
    let mut groups: BTreeMap<String, Vec<BoardSighting>> = BTreeMap::new();
    for sighting in sightings {
        groups.entry(sighting.identity.clone()).or_default().push(sighting);
    }
    let identities = groups.len();

    let outcomes: Vec<IdentityOutcome> = stream::iter(groups)
        .map(|(identity, group)| merge_identity(svc, identity, group))
        .buffer_unordered(svc.settings.concurrency.max(1))
        .try_collect()
        .await?;

    let mut report = MergeReport {
        identities,
        ..Default::default()
    };
    for outcome in outcomes {
        if outcome.changed {
            report.updated += 1;
        }
        report.created.extend(outcome.created);
    }

    if report.updated > 0 {
        tracing::info!(updated = report.updated, "updated controllers");
        if let Err(e) = summary::invalidate(svc.cache.as_ref()).await {
            tracing::warn!(error = %e, "could not invalidate usage summary");
        }
    }

    let notifier = svc.notifier.as_ref();
    join_all(report.created.iter().map(|name| async move {
        if let Err(e) = notifier.notify(NEW_DEVICE_SUBJECT, name).await {
            tracing::info!(board = %name, error = %e, "error notifying about new board");
        }
    }))
    .await;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::Barrier;

    use crate::cache::memory::InMemoryCache;
    use crate::models::SubmissionMeta;
    use crate::queue::memory::InMemoryQueue;
    use crate::store::memory::InMemoryStore;
    use crate::store::KeyValueStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn sighting(secs: i64, name: &str, fp: &str) -> BoardSighting {
        BoardSighting {
            identity: "abc".to_string(),
            name: name.to_string(),
            hardware_rev: 1,
            git_hash: format!("hash-{secs}"),
            git_tag: format!("tag-{secs}"),
            uavo_hash: String::new(),
            meta: SubmissionMeta {
                fingerprint: fp.to_string(),
                timestamp: at(secs),
                os: "Windows 10".to_string(),
                arch: "x86_64".to_string(),
                version: "15.09".to_string(),
                addr: "1.2.3.4".to_string(),
                share_addr: false,
                country: "NZ".to_string(),
                region: String::new(),
                city: String::new(),
                lat: 0.0,
                lon: 0.0,
            },
        }
    }

    #[test]
    fn test_fold_new_record() {
        let fc = fold(None, &sighting(100, "CC3D", "a"));
        assert_eq!(fc.count, 1);
        assert_eq!(fc.oldest, at(100));
        assert_eq!(fc.timestamp, at(100));
        assert_eq!(fc.addr, "");
        assert!(!fc.counted);
    }

    #[test]
    fn test_later_sighting_wins_in_either_order() {
        let s1 = sighting(100, "CopterControl", "a");
        let s2 = sighting(200, "CC3D", "b");
        let forward = fold(Some(fold(None, &s1)), &s2);
        let backward = fold(Some(fold(None, &s2)), &s1);
        for fc in [&forward, &backward] {
            assert_eq!(fc.name, "CC3D");
            assert_eq!(fc.git_hash, "hash-200");
            assert_eq!(fc.timestamp, at(200));
            assert_eq!(fc.oldest, at(100));
            assert_eq!(fc.count, 2);
        }
    }

    #[test]
    fn test_equal_timestamp_does_not_overwrite() {
        let first = fold(None, &sighting(100, "first", "a"));
        let second = fold(Some(first), &sighting(100, "second", "b"));
        assert_eq!(second.name, "first");
        assert_eq!(second.count, 2);
    }

    #[test]
    fn test_counted_survives_fold() {
        let mut fc = fold(None, &sighting(100, "CC3D", "a"));
        fc.counted = true;
        let fc = fold(Some(fc), &sighting(300, "CC3D", "b"));
        assert!(fc.counted);
    }

    fn services(store: &InMemoryStore, notifier: Arc<dyn Notifier>) -> Services {
        Services::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryCache::new()),
            notifier,
        )
    }

    async fn stored(store: &InMemoryStore, identity: &str) -> FoundController {
        let entity = store.get(&FoundController::key_for(identity)).await.unwrap();
        from_entity(entity).unwrap()
    }

    fn permutations(items: &[BoardSighting]) -> Vec<Vec<BoardSighting>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_replay_is_noop_after_many_submissions() {
        let store = InMemoryStore::new();
        let svc = services(&store, Arc::new(NoopNotifier));
        let batch: Vec<_> = (0..40).map(|i| sighting(i, "CC3D", &format!("fp-{i}"))).collect();
        merge_sightings(&svc, batch).await.unwrap();
        assert_eq!(stored(&store, "abc").await.count, 40);

        let report = merge_sightings(&svc, vec![sighting(0, "CC3D", "fp-0")]).await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(stored(&store, "abc").await.count, 40);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_folds_once() {
        let store = InMemoryStore::new();
        let svc = services(&store, Arc::new(NoopNotifier));
        let batch = vec![sighting(100, "CC3D", "a"), sighting(100, "CC3D", "a")];
        merge_sightings(&svc, batch).await.unwrap();
        assert_eq!(stored(&store, "abc").await.count, 1);
    }

    #[tokio::test]
    async fn test_destroyed_record_counts_submission_again() {
        let store = InMemoryStore::new();
        let svc = services(&store, Arc::new(NoopNotifier));
        merge_sightings(&svc, vec![sighting(100, "CC3D", "a")]).await.unwrap();
        let first_epoch = stored(&store, "abc").await.epoch;
        store.delete(&FoundController::key_for("abc")).await.unwrap();

        let report = merge_sightings(&svc, vec![sighting(100, "CC3D", "a")]).await.unwrap();
        assert_eq!(report.created, vec!["CC3D".to_string()]);
        let fc = stored(&store, "abc").await;
        assert_eq!(fc.count, 1);
        assert_ne!(fc.epoch, first_epoch);
    }

    #[tokio::test]
    async fn test_every_arrival_order_converges_monotonically() {
        let sightings = vec![
            sighting(300, "third", "c"),
            sighting(100, "first", "a"),
            sighting(400, "fourth", "d"),
            sighting(200, "second", "b"),
        ];
        for order in permutations(&sightings) {
            let store = InMemoryStore::new();
            let svc = services(&store, Arc::new(NoopNotifier));
            let mut newest = at(0);
            let mut oldest = at(i64::from(i32::MAX));
            for (step, s) in order.iter().enumerate() {
                merge_sightings(&svc, vec![s.clone()]).await.unwrap();
                newest = newest.max(s.meta.timestamp);
                oldest = oldest.min(s.meta.timestamp);
                let fc = stored(&store, "abc").await;
                assert_eq!(fc.count, step as i64 + 1);
                assert_eq!(fc.timestamp, newest);
                assert_eq!(fc.oldest, oldest);
            }
            let fc = stored(&store, "abc").await;
            assert_eq!(fc.name, "fourth");
            assert_eq!(fc.git_hash, "hash-400");
        }
    }

    struct RendezvousNotifier {
        barrier: Barrier,
    }

    #[async_trait]
    impl Notifier for RendezvousNotifier {
        async fn notify(&self, _subject: &str, _body: &str) -> Result<()> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_new_device_notifications_are_sent_concurrently() {
        let store = InMemoryStore::new();
        let notifier = Arc::new(RendezvousNotifier {
            barrier: Barrier::new(2),
        });
        let svc = services(&store, notifier);
        let mut other = sighting(100, "Revolution", "b");
        other.identity = "def".to_string();
        let batch = vec![sighting(100, "CC3D", "a"), other];

        let report = tokio::time::timeout(Duration::from_secs(5), merge_sightings(&svc, batch))
            .await
            .expect("each notification waits for the other")
            .unwrap();
        assert_eq!(report.created.len(), 2);
    }
}
