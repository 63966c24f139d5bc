//! Pipeline error taxonomy.
//!
//! Most orchestration code returns `anyhow::Result`. The variants here are
//! the ones whose identity changes what the caller does with a task, so they
//! are typed and recovered with `anyhow::Error::downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The downstream queue is at or above the resubmission threshold.
    #[error("busy: {queue} has {pending} pending tasks (threshold {threshold})")]
    Busy {
        queue: String,
        pending: usize,
        threshold: usize,
    },

    /// A destructive batch named a kind outside the allow-list.
    #[error("not allow-listed: {kind}")]
    NotAllowed { kind: String },

    #[error("Kind parameter is required")]
    MissingKind,

    /// A task payload that can never be processed.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// One or more queue submissions in a fan-out failed.
    #[error("dispatch failed: {failed} of {total} submissions failed: {first}")]
    Dispatch {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("transaction failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl PipelineError {
    /// Rejections never succeed on redelivery.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::NotAllowed { .. }
                | PipelineError::MissingKind
                | PipelineError::Malformed(_)
        )
    }
}
