//! Usage rollups by OS, board, country and version.
//!
//! [`usage_summary`] is a read-through over the cache: a hit is returned as
//! is, a miss recomputes from every [`FoundController`] and writes back with
//! the configured TTL. The merge engine calls [`invalidate`] whenever it
//! changes a controller.
//!
//! A recompute can race an invalidation: the controllers are read, a merge
//! lands and invalidates, then the recompute writes its now stale result.
//! [`invalidate`] bumps a generation stamp before deleting the summary, and a
//! recompute that sees the stamp move across its write deletes what it wrote.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use uuid::Uuid;

use crate::cache::{self, Cache, CacheError};
use crate::context::Services;
use crate::models::{FoundController, KIND_FOUND_CONTROLLER};
use crate::sighting::{abbrev_os, AliasTable};
use crate::store::{load_all, Query};

pub const SUMMARY_CACHE_KEY: &str = "controllerStats";
pub const SUMMARY_GENERATION_KEY: &str = "controllerStats:generation";

/// Version label for controllers without a firmware tag.
pub const UNKNOWN_VERSION: &str = "Unknown";

type Tally = BTreeMap<String, u64>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub os_board: BTreeMap<String, Tally>,
    pub os_detail: Tally,
    pub board: Tally,
    pub board_rev: BTreeMap<String, Tally>,
    pub country_board: BTreeMap<String, Tally>,
    pub version_board: BTreeMap<String, Tally>,
}

fn bump(tally: &mut Tally, key: &str) {
    *tally.entry(key.to_string()).or_default() += 1;
}

fn bump2(table: &mut BTreeMap<String, Tally>, outer: &str, inner: &str) {
    bump(table.entry(outer.to_string()).or_default(), inner);
}

impl UsageSummary {
    pub fn add(&mut self, fc: &FoundController, aliases: &AliasTable) {
        let board = aliases.canonical(&fc.name);
        let version = if fc.git_tag.is_empty() {
            UNKNOWN_VERSION
        } else {
            fc.git_tag.as_str()
        };

        bump(&mut self.os_detail, &fc.gcs_os);
        bump(&mut self.board, board);
        bump2(&mut self.country_board, &fc.country, board);
        bump2(&mut self.os_board, abbrev_os(&fc.gcs_os), board);
        bump2(&mut self.board_rev, board, &fc.hardware_rev.to_string());
        bump2(&mut self.version_board, version, board);
    }

    pub fn compute<'a, I>(controllers: I, aliases: &AliasTable) -> Self
    where
        I: IntoIterator<Item = &'a FoundController>,
    {
        let mut summary = Self::default();
        for fc in controllers {
            summary.add(fc, aliases);
        }
        summary
    }

    pub fn controllers(&self) -> u64 {
        self.board.values().sum()
    }
}

/// Drop the cached summary and mark any recompute in flight as stale.
pub async fn invalidate(cache: &dyn Cache) -> Result<(), CacheError> {
    let stamp = Uuid::new_v4().to_string().into_bytes();
    cache.set(SUMMARY_GENERATION_KEY, stamp, None).await?;
    cache.delete(SUMMARY_CACHE_KEY).await
}

async fn generation(cache: &dyn Cache) -> Option<Vec<u8>> {
    cache.get(SUMMARY_GENERATION_KEY).await.ok().flatten()
}

pub async fn usage_summary(svc: &Services) -> Result<UsageSummary> {
    if let Some(hit) = cache::get_json::<UsageSummary>(svc.cache.as_ref(), SUMMARY_CACHE_KEY).await {
        tracing::debug!("usage summary served from cache");
        return Ok(hit);
    }

    let before = generation(svc.cache.as_ref()).await;
    let query = Query::new(KIND_FOUND_CONTROLLER).order("-timestamp");
    let controllers: Vec<FoundController> = load_all(svc.store.as_ref(), query).await?;
    let summary = UsageSummary::compute(&controllers, &svc.aliases);
    tracing::info!(controllers = controllers.len(), "recomputed usage summary");

    cache::set_json(
        svc.cache.as_ref(),
        SUMMARY_CACHE_KEY,
        &summary,
        Some(svc.settings.summary_ttl),
    )
    .await;
    if generation(svc.cache.as_ref()).await != before {
        tracing::debug!("usage summary invalidated during recompute");
        if let Err(e) = svc.cache.delete(SUMMARY_CACHE_KEY).await {
            tracing::warn!(error = %e, "could not drop stale usage summary");
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::cache::memory::InMemoryCache;
    use crate::merge::NoopNotifier;
    use crate::models::Key;
    use crate::queue::memory::InMemoryQueue;
    use crate::store::memory::InMemoryStore;
    use crate::store::{
        to_entity, Entity, KeyValueStore, QueryPage, StoreError, Transaction,
    };

    fn controller(uuid: &str, name: &str, os: &str, tag: &str, rev: i64) -> FoundController {
        FoundController {
            uuid: uuid.to_string(),
            count: 1,
            hardware_rev: rev,
            name: name.to_string(),
            git_hash: String::new(),
            git_tag: tag.to_string(),
            uavo_hash: String::new(),
            gcs_os: os.to_string(),
            gcs_arch: String::new(),
            gcs_version: String::new(),
            addr: String::new(),
            country: "US".to_string(),
            region: String::new(),
            city: String::new(),
            lat: 0.0,
            lon: 0.0,
            oldest: Utc::now(),
            timestamp: Utc::now(),
            counted: false,
            epoch: String::new(),
            key: None,
        }
    }

    #[test]
    fn test_compute_rollups() {
        let fcs = vec![
            controller("a", "CopterControl", "Windows 10", "", 1),
            controller("b", "CC3D", "Ubuntu 14.04", "RELEASE-15.09", 2),
            controller("c", "Revolution", "Windows 7", "RELEASE-15.09", 3),
        ];
        let s = UsageSummary::compute(&fcs, &AliasTable::default());
        assert_eq!(s.board["CC3D"], 2);
        assert_eq!(s.os_board["Windows"]["CC3D"], 1);
        assert_eq!(s.os_board["Windows"]["Revolution"], 1);
        assert_eq!(s.os_board["Linux"]["CC3D"], 1);
        assert_eq!(s.os_detail["Windows 10"], 1);
        assert_eq!(s.board_rev["CC3D"]["1"], 1);
        assert_eq!(s.version_board["Unknown"]["CC3D"], 1);
        assert_eq!(s.version_board["RELEASE-15.09"]["CC3D"], 1);
        assert_eq!(s.country_board["US"]["CC3D"], 2);
        assert_eq!(s.controllers(), 3);
    }

    #[tokio::test]
    async fn test_summary_is_cached_until_invalidated() {
        let store = InMemoryStore::new();
        let cache = InMemoryCache::new();
        let svc = Services::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(cache.clone()),
            Arc::new(NoopNotifier),
        );
        let fc = controller("a", "CC3D", "Windows 10", "", 1);
        store
            .put(&FoundController::key_for("a"), to_entity(&fc).unwrap())
            .await
            .unwrap();

        assert_eq!(usage_summary(&svc).await.unwrap().controllers(), 1);
        assert!(cache.contains(SUMMARY_CACHE_KEY));

        let fc = controller("b", "CC3D", "Windows 10", "", 1);
        store
            .put(&FoundController::key_for("b"), to_entity(&fc).unwrap())
            .await
            .unwrap();
        assert_eq!(usage_summary(&svc).await.unwrap().controllers(), 1);

        invalidate(&cache).await.unwrap();
        assert_eq!(usage_summary(&svc).await.unwrap().controllers(), 2);
    }

    /// Store whose first query is followed by a controller write and an
    /// invalidation, as if a merge committed mid-recompute.
    struct RacingStore {
        inner: InMemoryStore,
        cache: InMemoryCache,
        raced: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for RacingStore {
        async fn get(&self, key: &Key) -> Result<Entity, StoreError> {
            self.inner.get(key).await
        }

        async fn get_multi(&self, keys: &[Key]) -> Result<Vec<Result<Entity, StoreError>>, StoreError> {
            self.inner.get_multi(keys).await
        }

        async fn put(&self, key: &Key, entity: Entity) -> Result<(), StoreError> {
            self.inner.put(key, entity).await
        }

        async fn put_multi(&self, entries: Vec<(Key, Entity)>) -> Result<(), StoreError> {
            self.inner.put_multi(entries).await
        }

        async fn delete(&self, key: &Key) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn delete_multi(&self, keys: &[Key]) -> Result<(), StoreError> {
            self.inner.delete_multi(keys).await
        }

        async fn query(&self, query: &Query) -> Result<QueryPage, StoreError> {
            let page = self.inner.query(query).await?;
            if !self.raced.swap(true, Ordering::SeqCst) {
                let fc = controller("late", "Revolution", "Windows 10", "", 1);
                self.inner
                    .put(&FoundController::key_for("late"), to_entity(&fc)?)
                    .await?;
                invalidate(&self.cache)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            Ok(page)
        }

        async fn kinds(&self) -> Result<Vec<String>, StoreError> {
            self.inner.kinds().await
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
            self.inner.begin().await
        }
    }

    #[tokio::test]
    async fn test_recompute_racing_invalidation_is_not_cached() {
        let inner = InMemoryStore::new();
        let cache = InMemoryCache::new();
        let fc = controller("a", "CC3D", "Windows 10", "", 1);
        inner
            .put(&FoundController::key_for("a"), to_entity(&fc).unwrap())
            .await
            .unwrap();
        let store = RacingStore {
            inner,
            cache: cache.clone(),
            raced: AtomicBool::new(false),
        };
        let svc = Services::new(
            Arc::new(store),
            Arc::new(InMemoryQueue::new()),
            Arc::new(cache.clone()),
            Arc::new(NoopNotifier),
        );

        assert_eq!(usage_summary(&svc).await.unwrap().controllers(), 1);
        assert!(!cache.contains(SUMMARY_CACHE_KEY));
        assert_eq!(usage_summary(&svc).await.unwrap().controllers(), 2);
        assert!(cache.contains(SUMMARY_CACHE_KEY));
    }
}
