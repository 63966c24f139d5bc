//! Usage payload → board sightings.
//!
//! A usage submission lists every controller the ground station saw under
//! `boardsSeen`. Each listing is resolved to a canonical identity (the
//! reported UUID, or a SHA-256 of the CPU serial when no UUID was sent),
//! its display name is canonicalized through the [`AliasTable`], and
//! duplicates within one submission collapse to the last listing.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{BoardSighting, SubmissionMeta, UsageEnvelope};

/// Display-name aliases applied before aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert("CopterControl".to_string(), "CC3D".to_string());
        Self { aliases }
    }
}

impl AliasTable {
    /// Built-in aliases plus `extra`, which wins on conflict.
    pub fn with_extra<I>(extra: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table = Self::default();
        table.aliases.extend(extra);
        table
    }

    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Collapse a ground-station OS description to a family name.
pub fn abbrev_os(os: &str) -> &str {
    const LINUX: &[&str] = &["Ubuntu", "openSUSE", "Gentoo", "Arch", "Debian"];
    if os.starts_with("Windows") {
        "Windows"
    } else if LINUX.iter().any(|p| os.starts_with(p)) {
        "Linux"
    } else if os.starts_with("OS X") {
        "Mac"
    } else {
        os
    }
}

/// One `boardsSeen` listing as clients send it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeenBoard {
    #[serde(rename = "ID", alias = "id", alias = "Id")]
    pub id: i64,
    #[serde(rename = "CPU", alias = "cpu", alias = "Cpu")]
    pub cpu: String,
    #[serde(rename = "UUID", alias = "uuid", alias = "Uuid")]
    pub uuid: String,
    #[serde(rename = "FwHash", alias = "fwHash", alias = "fwhash")]
    pub fw_hash: String,
    #[serde(rename = "GitHash", alias = "gitHash", alias = "githash")]
    pub git_hash: String,
    #[serde(rename = "GitTag", alias = "gitTag", alias = "gittag")]
    pub git_tag: String,
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "UavoHash", alias = "uavoHash", alias = "uavohash")]
    pub uavo_hash: String,
}

impl SeenBoard {
    /// The reported UUID, else the hex SHA-256 of the CPU serial.
    pub fn identity(&self) -> Option<String> {
        if !self.uuid.is_empty() {
            return Some(self.uuid.clone());
        }
        if self.cpu.is_empty() {
            return None;
        }
        Some(hex::encode(Sha256::digest(self.cpu.as_bytes())))
    }
}

/// The parts of a usage submission the rollup reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UsagePayload {
    #[serde(rename = "boardsSeen", alias = "BoardsSeen", alias = "boardsseen")]
    pub boards_seen: Vec<SeenBoard>,
    #[serde(rename = "currentOS", alias = "CurrentOS", alias = "currentOs")]
    pub current_os: String,
    #[serde(rename = "currentArch", alias = "CurrentArch")]
    pub current_arch: String,
    #[serde(rename = "gcs_version", alias = "GCSVersion", alias = "gcsVersion")]
    pub gcs_version: String,
    #[serde(rename = "shareIP", alias = "ShareIP", alias = "shareIp")]
    pub share_ip: Value,
}

impl UsagePayload {
    pub fn parse(raw: &Value) -> Result<Self> {
        Self::deserialize(raw).context("usage payload does not match the expected shape")
    }

    /// Clients send `"true"`; a JSON boolean is accepted as well.
    pub fn shares_address(&self) -> bool {
        match &self.share_ip {
            Value::Bool(b) => *b,
            Value::String(s) => s == "true",
            _ => false,
        }
    }
}

/// Stable fingerprint of a submission: same envelope, same fingerprint.
pub fn fingerprint(envelope: &UsageEnvelope) -> String {
    let mut hasher = Sha256::new();
    hasher.update(envelope.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(envelope.ip.as_bytes());
    hasher.update([0]);
    hasher.update(envelope.raw_data.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Extract the de-duplicated sightings of one submission.
///
/// Fails only when the payload itself is unusable; listings without any
/// identity are logged and dropped.
pub fn extract(envelope: &UsageEnvelope, aliases: &AliasTable) -> Result<Vec<BoardSighting>> {
    let payload = UsagePayload::parse(&envelope.raw_data)?;
    let meta = SubmissionMeta {
        fingerprint: fingerprint(envelope),
        timestamp: envelope.timestamp,
        os: payload.current_os.clone(),
        arch: payload.current_arch.clone(),
        version: payload.gcs_version.clone(),
        addr: envelope.ip.clone(),
        share_addr: payload.shares_address(),
        country: envelope.country.clone(),
        region: envelope.region.clone(),
        city: envelope.city.clone(),
        lat: envelope.lat,
        lon: envelope.lon,
    };

    let mut sightings: Vec<BoardSighting> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for board in &payload.boards_seen {
        let Some(identity) = board.identity() else {
            tracing::info!(name = %board.name, id = board.id, "no UUID or CPU id in listing");
            continue;
        };
        let sighting = BoardSighting {
            identity: identity.clone(),
            name: aliases.canonical(&board.name).to_string(),
            hardware_rev: board.id & 0xff,
            git_hash: board.git_hash.clone(),
            git_tag: board.git_tag.clone(),
            uavo_hash: board.uavo_hash.clone(),
            meta: meta.clone(),
        };
        match positions.get(&identity) {
            Some(&i) => sightings[i] = sighting,
            None => {
                positions.insert(identity, sightings.len());
                sightings.push(sighting);
            }
        }
    }
    Ok(sightings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn envelope(raw: Value) -> UsageEnvelope {
        UsageEnvelope {
            ip: "1.2.3.4".to_string(),
            country: "US".to_string(),
            region: "CA".to_string(),
            city: "Davis".to_string(),
            lat: 38.5,
            lon: -121.7,
            timestamp: Utc.timestamp_opt(1_450_000_000, 0).unwrap(),
            raw_data: raw,
        }
    }

    #[test]
    fn test_abbrev_os() {
        assert_eq!(abbrev_os("Windows 10"), "Windows");
        assert_eq!(abbrev_os("Ubuntu 15.10"), "Linux");
        assert_eq!(abbrev_os("Arch Linux"), "Linux");
        assert_eq!(abbrev_os("OS X 10.11"), "Mac");
        assert_eq!(abbrev_os("FreeBSD"), "FreeBSD");
    }

    #[test]
    fn test_alias_table_extra_entries() {
        let table = AliasTable::with_extra([("Revolution".to_string(), "Revo".to_string())]);
        assert_eq!(table.canonical("CopterControl"), "CC3D");
        assert_eq!(table.canonical("Revolution"), "Revo");
        assert_eq!(table.canonical("Sparky2"), "Sparky2");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_identity_prefers_uuid_then_cpu_hash() {
        let raw = json!({
            "boardsSeen": [
                {"UUID": "u-1", "CPU": "cpu-a", "Name": "CopterControl", "ID": 0x0401},
                {"CPU": "cpu-b", "Name": "Revolution", "ID": 0x0903},
                {"Name": "Orphan"}
            ],
            "currentOS": "Windows 7",
            "shareIP": "true"
        });
        let sightings = extract(&envelope(raw), &AliasTable::default()).unwrap();
        assert_eq!(sightings.len(), 2);
        assert_eq!(sightings[0].identity, "u-1");
        assert_eq!(sightings[0].name, "CC3D");
        assert_eq!(sightings[0].hardware_rev, 1);
        assert_eq!(
            sightings[1].identity,
            hex::encode(Sha256::digest(b"cpu-b"))
        );
        assert_eq!(sightings[1].hardware_rev, 3);
        assert!(sightings[0].meta.share_addr);
        assert_eq!(sightings[0].meta.os, "Windows 7");
    }

    #[test]
    fn test_last_listing_wins_within_submission() {
        let raw = json!({
            "boardsSeen": [
                {"UUID": "u-1", "Name": "first"},
                {"UUID": "u-2", "Name": "other"},
                {"UUID": "u-1", "Name": "second"}
            ]
        });
        let sightings = extract(&envelope(raw), &AliasTable::default()).unwrap();
        assert_eq!(sightings.len(), 2);
        assert_eq!(sightings[0].identity, "u-1");
        assert_eq!(sightings[0].name, "second");
    }

    #[test]
    fn test_lowercase_field_names_accepted() {
        let raw = json!({"boardsSeen": [{"uuid": "x", "name": "Sparky2", "id": 7}]});
        let sightings = extract(&envelope(raw), &AliasTable::default()).unwrap();
        assert_eq!(sightings[0].identity, "x");
        assert_eq!(sightings[0].name, "Sparky2");
        assert!(!sightings[0].meta.share_addr);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(extract(&envelope(json!({"boardsSeen": "nope"})), &AliasTable::default()).is_err());
        assert!(extract(&envelope(json!([1, 2])), &AliasTable::default()).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = envelope(json!({"boardsSeen": []}));
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b.ip = "5.6.7.8".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
