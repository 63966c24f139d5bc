//! Resumable cursor paginator.
//!
//! One invocation enumerates at most `page_limit` keys of a kind, hands them
//! to [`dispatch`](crate::dispatch::dispatch) for the `next` path, and, when
//! the kind is not exhausted, re-enqueues itself with the continuation
//! cursor. The chain of invocations visits every key exactly once.
//!
//! ```text
//!  MapRequest{kind, next, cursor}
//!        │
//!        ▼
//!   admit(work queue) ── busy ──▶ PipelineError::Busy
//!        │
//!        ▼
//!   query keys-only, limit = page_limit, start = cursor
//!        │
//!        ├──▶ dispatch chunks ──▶ [work]  (only when `next` is set)
//!        │
//!        └──▶ not done? ──▶ MapRequest{.., cursor'} ──▶ [map]
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::backpressure;
use crate::context::Services;
use crate::dispatch::{self, DispatchReport};
use crate::error::PipelineError;
use crate::queue::Task;
use crate::stages::PATH_MAP;
use crate::store::{Cursor, Query};

pub const PARAM_KIND: &str = "kind";
pub const PARAM_NEXT: &str = "next";
pub const PARAM_CURSOR: &str = "cursor";

/// Who asked for a paginator job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Cron,
    Interactive,
}

/// What the initiator is told once the job is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Plain completion signal for the scheduler.
    Done,
    /// User-facing acknowledgement.
    Started,
}

impl Acknowledgement {
    pub fn message(&self) -> &'static str {
        match self {
            Acknowledgement::Done => "",
            Acknowledgement::Started => "Started",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub kind: String,
    /// Processing path for dispatched chunks. `None` only counts keys.
    pub next: Option<String>,
    pub cursor: Option<Cursor>,
}

impl MapRequest {
    pub fn new(kind: impl Into<String>, next: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            next: next.filter(|n| !n.is_empty()),
            cursor: None,
        }
    }

    pub fn from_task(task: &Task) -> Result<Self, PipelineError> {
        let kind = task.param(PARAM_KIND).ok_or(PipelineError::MissingKind)?;
        Ok(Self {
            kind: kind.to_string(),
            next: task.param(PARAM_NEXT).map(str::to_string),
            cursor: task.param(PARAM_CURSOR).map(Cursor::new),
        })
    }

    pub fn to_task(&self) -> Task {
        let mut params = BTreeMap::new();
        params.insert(PARAM_KIND.to_string(), self.kind.clone());
        if let Some(next) = &self.next {
            params.insert(PARAM_NEXT.to_string(), next.clone());
        }
        if let Some(cursor) = &self.cursor {
            params.insert(PARAM_CURSOR.to_string(), cursor.as_str().to_string());
        }
        Task::with_params(PATH_MAP, params)
    }
}

/// Outcome of one paginator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReport {
    pub keys: usize,
    pub dispatched: DispatchReport,
    /// True when the kind was exhausted by this page.
    pub finished: bool,
    /// Cursor handed to the continuation, if one was queued.
    pub continuation: Option<Cursor>,
}

/// Queue the first page of a paginator job.
pub async fn submit_map(svc: &Services, request: MapRequest, trigger: Trigger) -> Result<Acknowledgement> {
    if request.kind.is_empty() {
        return Err(PipelineError::MissingKind.into());
    }
    svc.queue
        .enqueue(&svc.queues.map, request.to_task())
        .await
        .context("queueing map job")?;
    match trigger {
        Trigger::Cron => {
            tracing::info!(kind = %request.kind, "submitted on behalf of cron");
            Ok(Acknowledgement::Done)
        }
        Trigger::Interactive => Ok(Acknowledgement::Started),
    }
}

/// Run one page of a paginator job.
#[tracing::instrument(skip(svc), fields(kind = %request.kind))]
pub async fn batch_map(svc: &Services, request: &MapRequest) -> Result<PageReport> {
    let settings = &svc.settings;
    backpressure::admit(svc.queue.as_ref(), &svc.queues.work, settings.resubmit_threshold).await?;

    let query = Query::new(&request.kind)
        .keys_only()
        .limit(settings.page_limit)
        .start(request.cursor.clone());
    let page = svc
        .store
        .query(&query)
        .await
        .with_context(|| format!("enumerating {} keys", request.kind))?;
    let keys: Vec<_> = page.entries.into_iter().map(|e| e.key).collect();

    tracing::info!(keys = keys.len(), finished = page.done, "enumerated page");

    let dispatched = match &request.next {
        Some(next) => {
            dispatch::dispatch(
                svc.queue.as_ref(),
                &svc.queues.work,
                next,
                &keys,
                settings.chunk_size,
                settings.concurrency,
            )
            .await?
        }
        None => DispatchReport::default(),
    };

    let continuation = if page.done {
        None
    } else {
        let cursor = page
            .cursor
            .context("store returned an unfinished page without a cursor")?;
        let resume = MapRequest {
            kind: request.kind.clone(),
            next: request.next.clone(),
            cursor: Some(cursor.clone()),
        };
        tracing::debug!(cursor = cursor.as_str(), "requesting more");
        svc.queue
            .enqueue(&svc.queues.map, resume.to_task())
            .await
            .context("queueing continuation")?;
        Some(cursor)
    };

    Ok(PageReport {
        keys: keys.len(),
        dispatched,
        finished: page.done,
        continuation,
    })
}
