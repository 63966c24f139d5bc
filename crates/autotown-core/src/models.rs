//! Core data models that flow through the rollup pipeline.
//!
//! Stored entities ([`UsageStat`], [`FoundController`], [`DailyCount`],
//! [`FoldMarker`]) are
//! serialized to JSON objects and addressed by a [`Key`]. Transient values
//! ([`UsageEnvelope`], [`BoardSighting`]) only exist on the wire or in
//! memory between stages.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KIND_USAGE_STAT: &str = "UsageStat";
pub const KIND_FOUND_CONTROLLER: &str = "FoundController";
pub const KIND_DAILY_COUNTS: &str = "DailyCounts";
pub const KIND_FOLD_MARKER: &str = "FoldedSubmission";

/// Calendar-day format used for day buckets.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key encoding: {0}")]
    Encoding(String),
    #[error("key has empty kind or name")]
    Empty,
}

/// Address of a stored entity: a collection kind plus a name unique within it.
///
/// The encoded form is an opaque URL-safe string suitable for task payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub kind: String,
    pub name: String,
}

impl Key {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn encode(&self) -> String {
        // A two-element array cannot fail to serialize.
        let json = serde_json::to_vec(&[&self.kind, &self.name]).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        let [kind, name]: [String; 2] =
            serde_json::from_slice(&raw).map_err(|e| KeyError::Encoding(e.to_string()))?;
        if kind.is_empty() || name.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self { kind, name })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.kind, self.name)
    }
}

/// Query results whose storage key is attached after loading.
///
/// Implemented explicitly by each entity type that wants to know where it
/// came from; see [`crate::store::load_all`].
pub trait HasAssignableKey {
    fn set_key(&mut self, key: Key);
}

/// A raw usage submission as stored: possibly compressed bytes plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStat {
    #[serde(with = "bytes_b64")]
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,

    #[serde(skip)]
    pub key: Option<Key>,
}

impl HasAssignableKey for UsageStat {
    fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }
}

/// Normalized submission envelope passed between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEnvelope {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    pub raw_data: serde_json::Value,
}

impl UsageEnvelope {
    pub fn from_stat(stat: &UsageStat, raw_data: serde_json::Value) -> Self {
        Self {
            ip: stat.addr.clone(),
            country: stat.country.clone(),
            region: stat.region.clone(),
            city: stat.city.clone(),
            lat: stat.lat,
            lon: stat.lon,
            timestamp: stat.timestamp,
            raw_data,
        }
    }
}

/// Durable, continuously merged knowledge about one canonical identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundController {
    pub uuid: String,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub hardware_rev: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub git_hash: String,
    #[serde(default)]
    pub git_tag: String,
    #[serde(default)]
    pub uavo_hash: String,

    #[serde(default)]
    pub gcs_os: String,
    #[serde(default)]
    pub gcs_arch: String,
    #[serde(default)]
    pub gcs_version: String,

    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,

    pub oldest: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,

    /// Set once this record has been reflected into [`DailyCount`]s.
    #[serde(default)]
    pub counted: bool,

    /// Incarnation of this record. Assigned when the record is created, so
    /// [`FoldMarker`]s left behind by a deleted predecessor do not match.
    #[serde(default)]
    pub epoch: String,

    #[serde(skip)]
    pub key: Option<Key>,
}

impl FoundController {
    pub fn key_for(uuid: &str) -> Key {
        Key::new(KIND_FOUND_CONTROLLER, uuid)
    }

    /// Day bucket this record is counted under.
    pub fn day_bucket(&self) -> String {
        self.oldest.format(DAY_FORMAT).to_string()
    }
}

impl HasAssignableKey for FoundController {
    fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }
}

/// Records that one submission has been folded into one identity's record.
///
/// A marker counts only while its `epoch` equals the record's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldMarker {
    pub epoch: String,
}

impl FoldMarker {
    pub fn key_for(identity: &str, fingerprint: &str) -> Key {
        Key::new(KIND_FOLD_MARKER, format!("{identity}/{fingerprint}"))
    }
}

/// Tally for one (day, display name) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub day: String,
    pub name: String,
    pub count: i64,
}

impl DailyCount {
    pub fn key_for(day: &str, name: &str) -> Key {
        Key::new(KIND_DAILY_COUNTS, format!("{day}/{name}"))
    }
}

/// Per-submission context attached to every sighting it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionMeta {
    /// Stable fingerprint of the submission; see [`FoldMarker`].
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub addr: String,
    /// Whether the client opted in to sharing its address.
    pub share_addr: bool,
    pub country: String,
    pub region: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

/// One observation of a controller inside a usage submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSighting {
    /// Canonical identity: the reported UUID or a hash of the CPU id.
    pub identity: String,
    /// Display name after alias canonicalization.
    pub name: String,
    pub hardware_rev: i64,
    pub git_hash: String,
    pub git_tag: String,
    pub uavo_hash: String,
    pub meta: SubmissionMeta,
}

mod bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
