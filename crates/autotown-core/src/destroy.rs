//! Allow-listed bulk deletes.
//!
//! A destroy task carries a compressed key list. The batch is validated as a
//! whole before anything is removed: one undecodable key or one kind outside
//! [`DESTRUCTIBLE_KINDS`] rejects every key in it.

use anyhow::{Context, Result};

use crate::codec;
use crate::error::PipelineError;
use crate::models::{Key, KIND_DAILY_COUNTS, KIND_FOLD_MARKER, KIND_FOUND_CONTROLLER};
use crate::store::KeyValueStore;

/// Kinds that may be bulk-deleted. Raw submissions are never on this list.
pub const DESTRUCTIBLE_KINDS: &[&str] = &[
    KIND_DAILY_COUNTS,
    KIND_FOUND_CONTROLLER,
    KIND_FOLD_MARKER,
];

/// Check every key against the allow-list.
pub fn validate(keys: &[Key]) -> Result<(), PipelineError> {
    match keys
        .iter()
        .find(|k| !DESTRUCTIBLE_KINDS.contains(&k.kind.as_str()))
    {
        Some(key) => {
            tracing::error!(kind = %key.kind, "refusing to destroy non-allow-listed kind");
            Err(PipelineError::NotAllowed {
                kind: key.kind.clone(),
            })
        }
        None => Ok(()),
    }
}

/// Decode, validate and delete a key chunk. Returns the number of keys removed.
pub async fn destroy(store: &dyn KeyValueStore, payload: &[u8]) -> Result<usize> {
    let keys = codec::decode_keys(payload)
        .map_err(|e| PipelineError::Malformed(format!("{e:#}")))?;
    tracing::info!(keys = keys.len(), "got keys to destroy");
    validate(&keys)?;
    store
        .delete_multi(&keys)
        .await
        .context("deleting batch")?;
    Ok(keys.len())
}
