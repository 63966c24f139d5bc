//! Rolling window of recent usage submissions.
//!
//! The window lives in the cache under [`RECENT_CACHE_KEY`] as a JSON list,
//! oldest first, and is read-modify-written by each storage invocation. It
//! is best-effort: a lost update drops one entry from a display feed.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{self, Cache};
use crate::models::UsageEnvelope;
use crate::sighting::{abbrev_os, AliasTable, UsagePayload};

pub const RECENT_CACHE_KEY: &str = "usageRollup";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentUsage {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub lat: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl RecentUsage {
    /// Summarize a submission. An unparseable payload still yields an entry
    /// with location and time.
    pub fn from_envelope(envelope: &UsageEnvelope, aliases: &AliasTable) -> Self {
        let payload = UsagePayload::parse(&envelope.raw_data).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "error decoding usage details");
            UsagePayload::default()
        });
        let boards: BTreeSet<String> = payload
            .boards_seen
            .iter()
            .map(|b| aliases.canonical(&b.name).to_string())
            .collect();
        Self {
            city: envelope.city.clone(),
            region: envelope.region.clone(),
            country: envelope.country.clone(),
            lon: envelope.lon,
            lat: envelope.lat,
            os: abbrev_os(&payload.current_os).to_string(),
            version: payload.gcs_version,
            boards: boards.into_iter().collect(),
            timestamp: envelope.timestamp,
        }
    }
}

/// Current window contents, optionally only entries strictly after `since`.
pub async fn read(cache: &dyn Cache, since: Option<DateTime<Utc>>) -> Vec<RecentUsage> {
    let window: Vec<RecentUsage> = cache::get_json(cache, RECENT_CACHE_KEY)
        .await
        .unwrap_or_default();
    match since {
        Some(since) => window.into_iter().filter(|e| e.timestamp > since).collect(),
        None => window,
    }
}

/// Append `entry`, evicting from the front beyond `limit` entries.
pub async fn append(cache: &dyn Cache, entry: RecentUsage, limit: usize) -> Result<()> {
    let mut window = read(cache, None).await;
    window.push(entry);
    if window.len() > limit {
        let excess = window.len() - limit;
        window.drain(..excess);
    }
    let bytes = serde_json::to_vec(&window)?;
    cache
        .set(RECENT_CACHE_KEY, bytes, None)
        .await
        .context("writing recent usage window")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryCache;
    use chrono::TimeZone;
    use serde_json::json;

    fn entry(secs: i64) -> RecentUsage {
        RecentUsage {
            city: String::new(),
            region: String::new(),
            country: "DE".to_string(),
            lon: 0.0,
            lat: 0.0,
            os: String::new(),
            version: String::new(),
            boards: Vec::new(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_window_evicts_oldest() {
        let cache = InMemoryCache::new();
        for i in 0..260 {
            append(&cache, entry(i), 256).await.unwrap();
        }
        let window = read(&cache, None).await;
        assert_eq!(window.len(), 256);
        assert_eq!(window[0].timestamp.timestamp(), 4);
        assert_eq!(window[255].timestamp.timestamp(), 259);
    }

    #[tokio::test]
    async fn test_since_is_exclusive() {
        let cache = InMemoryCache::new();
        for i in 0..5 {
            append(&cache, entry(i * 10), 256).await.unwrap();
        }
        let since = Utc.timestamp_opt(20, 0).unwrap();
        let newer = read(&cache, Some(since)).await;
        assert_eq!(newer.len(), 2);
        assert_eq!(newer[0].timestamp.timestamp(), 30);
    }

    #[test]
    fn test_entry_from_envelope() {
        let envelope = UsageEnvelope {
            ip: "1.2.3.4".to_string(),
            country: "AU".to_string(),
            region: String::new(),
            city: "Perth".to_string(),
            lat: -31.9,
            lon: 115.8,
            timestamp: Utc.timestamp_opt(1000, 0).unwrap(),
            raw_data: json!({
                "currentOS": "OS X 10.10",
                "gcs_version": "RELEASE-15.09",
                "boardsSeen": [{"Name": "CopterControl"}, {"Name": "CC3D"}, {"Name": "Revolution"}]
            }),
        };
        let e = RecentUsage::from_envelope(&envelope, &AliasTable::default());
        assert_eq!(e.os, "Mac");
        assert_eq!(e.version, "RELEASE-15.09");
        assert_eq!(e.boards, vec!["CC3D".to_string(), "Revolution".to_string()]);
        assert_eq!(e.city, "Perth");
    }
}
