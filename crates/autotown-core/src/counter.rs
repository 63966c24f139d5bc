//! Idempotent daily counter.
//!
//! Each not-yet-counted [`FoundController`] adds one to the
//! [`DailyCount`] for the day it was first seen and its display name, and
//! is flagged `counted` in the same transaction. Re-running the counter
//! over the same keys changes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::context::Services;
use crate::models::{DailyCount, FoundController, Key, KIND_FOUND_CONTROLLER};
use crate::store::{from_entity, run_in_transaction, to_entity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountReport {
    /// Records newly reflected into daily counts.
    pub counted: usize,
    /// Records already counted.
    pub skipped: usize,
    pub missing: usize,
    /// Day buckets written.
    pub buckets: usize,
}

impl CountReport {
    fn absorb(&mut self, other: CountReport) {
        self.counted += other.counted;
        self.skipped += other.skipped;
        self.missing += other.missing;
        self.buckets += other.buckets;
    }
}

async fn count_group(svc: &Services, keys: Vec<Key>) -> Result<CountReport> {
    let keys = Arc::new(keys);
    run_in_transaction(svc.store.as_ref(), svc.settings.tx_attempts, move |tx| {
        let keys = Arc::clone(&keys);
        Box::pin(async move {
            let mut report = CountReport::default();
            let records = tx.get_multi(&keys).await?;

            let mut increments: BTreeMap<(String, String), i64> = BTreeMap::new();
            let mut flipped = Vec::new();
            for (key, entity) in keys.iter().zip(records) {
                let Some(entity) = entity else {
                    tracing::warn!(key = %key, "controller missing, not counting");
                    report.missing += 1;
                    continue;
                };
                let mut fc: FoundController = from_entity(entity)?;
                if fc.counted {
                    report.skipped += 1;
                    continue;
                }
                fc.counted = true;
                *increments.entry((fc.day_bucket(), fc.name.clone())).or_default() += 1;
                flipped.push((key.clone(), fc));
            }

            if increments.is_empty() {
                tracing::debug!("nothing to do");
                return Ok(report);
            }

            let bucket_keys: Vec<Key> = increments
                .keys()
                .map(|(day, name)| DailyCount::key_for(day, name))
                .collect();
            let current = tx.get_multi(&bucket_keys).await?;
            for ((bucket_key, ((day, name), incr)), existing) in
                bucket_keys.into_iter().zip(increments).zip(current)
            {
                let mut bucket = match existing {
                    Some(entity) => from_entity::<DailyCount>(entity)?,
                    None => DailyCount {
                        day,
                        name,
                        count: 0,
                    },
                };
                bucket.count += incr;
                tx.put(bucket_key, to_entity(&bucket)?);
                report.buckets += 1;
            }

            report.counted = flipped.len();
            for (key, fc) in flipped {
                tx.put(key, to_entity(&fc)?);
            }
            Ok(report)
        })
    })
    .await
}

/// Count a batch of [`FoundController`] keys in small transactional groups.
///
/// Groups run concurrently; a group that exhausts its transaction attempts
/// fails the whole call.
#[tracing::instrument(skip_all, fields(keys = keys.len()))]
pub async fn count_usage(svc: &Services, keys: Vec<Key>) -> Result<CountReport> {
    let (keys, foreign): (Vec<Key>, Vec<Key>) =
        keys.into_iter().partition(|k| k.kind == KIND_FOUND_CONTROLLER);
    for key in &foreign {
        tracing::warn!(key = %key, "not a controller key, skipping");
    }

    let group_size = svc.settings.tx_group_size.max(1);
    let groups: Vec<Vec<Key>> = keys.chunks(group_size).map(<[Key]>::to_vec).collect();

    let reports: Vec<CountReport> = stream::iter(groups)
        .map(|group| count_group(svc, group))
        .buffer_unordered(svc.settings.concurrency.max(1))
        .try_collect()
        .await?;

    let mut total = CountReport::default();
    for report in reports {
        total.absorb(report);
    }
    tracing::info!(
        counted = total.counted,
        skipped = total.skipped,
        buckets = total.buckets,
        "counted usage"
    );
    Ok(total)
}
