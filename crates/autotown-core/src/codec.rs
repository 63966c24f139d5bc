//! Wire codec for payloads passed between pipeline stages.
//!
//! Two payload shapes travel through the queues: a gzip-compressed JSON list
//! of encoded [`Key`]s, and a compressed JSON [`UsageEnvelope`]. Stored
//! submission bodies use the same opportunistic compression: the gzip form
//! is kept only when it is smaller than the input.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::models::{Key, UsageEnvelope};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Compress `data`, returning the original bytes when gzip does not help.
pub fn gz(data: &[u8]) -> Result<Vec<u8>> {
    let compressed = compress(data).context("gzip compression failed")?;
    if compressed.len() < data.len() {
        Ok(compressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Inverse of [`gz`]: inflate gzip input, pass anything else through.
pub fn ungz(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 2 || data[..2] != GZIP_MAGIC {
        return Ok(data.to_vec());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("gzip decompression failed")?;
    Ok(out)
}

/// Encode a chunk of keys as a gzip-compressed JSON list of strings.
pub fn encode_keys(keys: &[Key]) -> Result<Vec<u8>> {
    let encoded: Vec<String> = keys.iter().map(Key::encode).collect();
    let json = serde_json::to_vec(&encoded)?;
    compress(&json)
}

/// Decode a key chunk produced by [`encode_keys`].
///
/// Fails on the first key that does not decode; a chunk is all-or-nothing.
pub fn decode_keys(payload: &[u8]) -> Result<Vec<Key>> {
    let json = ungz(payload)?;
    let encoded: Vec<String> =
        serde_json::from_slice(&json).context("key payload is not a JSON string list")?;
    encoded
        .iter()
        .map(|k| Key::decode(k).with_context(|| format!("error decoding key {k:?}")))
        .collect()
}

pub fn encode_envelope(envelope: &UsageEnvelope) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(envelope)?;
    gz(&json)
}

pub fn decode_envelope(payload: &[u8]) -> Result<UsageEnvelope> {
    let json = ungz(payload)?;
    serde_json::from_slice(&json).context("error decoding usage envelope")
}
