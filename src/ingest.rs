//! Usage submission intake for `autotown ingest`.
//!
//! Wraps a JSON usage report in an envelope carrying the caller-supplied
//! origin and the current time, then queues it for asynchronous storage and
//! rollup.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use autotown_core::models::UsageEnvelope;
use autotown_core::stages;
use autotown_core::Services;

/// Where a submission came from.
#[derive(Debug, Clone, Default)]
pub struct Origin {
    pub ip: String,
    pub country: String,
    pub region: String,
    pub city: String,
    /// `"lat,lon"`, as geolocating proxies report it.
    pub latlong: Option<String>,
}

/// Parse `"lat,lon"`; anything unparseable reads as the origin.
pub fn parse_latlong(s: &str) -> (f64, f64) {
    let mut parts = s.splitn(2, ',');
    let lat = parts.next().and_then(|p| p.trim().parse().ok());
    let lon = parts.next().and_then(|p| p.trim().parse().ok());
    match (lat, lon) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => (0.0, 0.0),
    }
}

pub fn envelope_for(raw_data: Value, origin: &Origin) -> UsageEnvelope {
    let (lat, lon) = origin
        .latlong
        .as_deref()
        .map(parse_latlong)
        .unwrap_or((0.0, 0.0));
    UsageEnvelope {
        ip: origin.ip.clone(),
        country: origin.country.clone(),
        region: origin.region.clone(),
        city: origin.city.clone(),
        lat,
        lon,
        timestamp: Utc::now(),
        raw_data,
    }
}

pub async fn ingest_file(svc: &Services, path: &Path, origin: &Origin) -> Result<UsageEnvelope> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read usage file: {}", path.display()))?;
    let raw_data: Value = serde_json::from_str(&content)
        .with_context(|| format!("Usage file is not JSON: {}", path.display()))?;
    let envelope = envelope_for(raw_data, origin);
    stages::accept_usage(svc, &envelope).await?;
    Ok(envelope)
}
