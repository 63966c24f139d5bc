//! Key-value store abstraction for Autotown.
//!
//! The [`KeyValueStore`] trait is the single source of truth for every
//! durable entity the pipeline touches. Entities are JSON objects addressed
//! by a [`Key`]; typed access goes through [`to_entity`] / [`from_entity`].
//!
//! Mutation that must be atomic (merging sightings, counting) runs inside a
//! [`Transaction`] with optimistic conflict detection, driven by
//! [`run_in_transaction`] with a bounded number of attempts.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`get`](KeyValueStore::get) | Fetch one entity or [`StoreError::NotFound`] |
//! | [`get_multi`](KeyValueStore::get_multi) | Fetch many, with a result per key |
//! | [`put`](KeyValueStore::put) / [`put_multi`](KeyValueStore::put_multi) | Upsert entities |
//! | [`delete`](KeyValueStore::delete) / [`delete_multi`](KeyValueStore::delete_multi) | Remove entities |
//! | [`query`](KeyValueStore::query) | One page of a kind, ordered, filtered, resumable |
//! | [`begin`](KeyValueStore::begin) | Start an optimistic transaction |

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::PipelineError;
use crate::models::{HasAssignableKey, Key};

/// A stored entity: a JSON object.
pub type Entity = Value;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such entity")]
    NotFound,
    /// A transaction observed a concurrent write to a key it read.
    #[error("transaction conflict")]
    Conflict,
    #[error("entity serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid cursor: {0}")]
    Cursor(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Opaque resume position produced by [`KeyValueStore::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Sort order on a named entity field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Order {
    Asc(String),
    Desc(String),
}

impl Order {
    /// Parse the `"field"` / `"-field"` shorthand.
    pub fn parse(shorthand: &str) -> Self {
        match shorthand.strip_prefix('-') {
            Some(field) => Order::Desc(field.to_string()),
            None => Order::Asc(shorthand.to_string()),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Order::Asc(f) | Order::Desc(f) => f,
        }
    }
}

/// Equality filter on an entity field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

/// One page request against a kind.
///
/// Without an [`Order`] entries come back in key order, which is stable
/// across a chain of cursors.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub kind: String,
    pub order: Option<Order>,
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
    pub start: Option<Cursor>,
    pub keys_only: bool,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn order(mut self, shorthand: &str) -> Self {
        self.order = Some(Order::parse(shorthand));
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start(mut self, cursor: Option<Cursor>) -> Self {
        self.start = cursor;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub key: Key,
    /// `None` for keys-only queries.
    pub entity: Option<Entity>,
}

#[derive(Debug, Clone)]
pub struct QueryPage {
    pub entries: Vec<QueryEntry>,
    /// Position after the last returned entry.
    pub cursor: Option<Cursor>,
    /// True when nothing remains after this page.
    pub done: bool,
}

/// An optimistic read-modify-write unit.
///
/// Reads record the version they observed; [`commit`](Transaction::commit)
/// applies the buffered writes only if none of those versions moved, and
/// otherwise fails with [`StoreError::Conflict`].
#[async_trait]
pub trait Transaction: Send {
    async fn get_multi(&mut self, keys: &[Key]) -> Result<Vec<Option<Entity>>, StoreError>;

    async fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError> {
        let mut found = self.get_multi(std::slice::from_ref(key)).await?;
        Ok(found.pop().flatten())
    }

    fn put(&mut self, key: Key, entity: Entity);

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Abstract durable store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Entity, StoreError>;

    /// Fetch many keys. The outer error is a backend failure; each inner
    /// result reports that key alone (typically [`StoreError::NotFound`]).
    async fn get_multi(&self, keys: &[Key]) -> Result<Vec<Result<Entity, StoreError>>, StoreError>;

    async fn put(&self, key: &Key, entity: Entity) -> Result<(), StoreError>;

    async fn put_multi(&self, entries: Vec<(Key, Entity)>) -> Result<(), StoreError>;

    async fn delete(&self, key: &Key) -> Result<(), StoreError>;

    async fn delete_multi(&self, keys: &[Key]) -> Result<(), StoreError>;

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError>;

    /// Names of every kind with at least one entity.
    async fn kinds(&self) -> Result<Vec<String>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

pub fn to_entity<T: Serialize>(value: &T) -> Result<Entity, StoreError> {
    Ok(serde_json::to_value(value)?)
}

pub fn from_entity<T: DeserializeOwned>(entity: Entity) -> Result<T, StoreError> {
    Ok(serde_json::from_value(entity)?)
}

/// Future returned by a unit of transactional work.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 't>>;

/// Run `work` inside a transaction, retrying on commit conflict.
///
/// `work` is re-invoked from scratch for each attempt, so it must not have
/// side effects outside the transaction. Errors from `work` itself are not
/// retried. After `max_attempts` conflicts the call fails with
/// [`PipelineError::RetriesExhausted`].
pub async fn run_in_transaction<T, F>(
    store: &dyn KeyValueStore,
    max_attempts: u32,
    mut work: F,
) -> anyhow::Result<T>
where
    T: Send,
    F: for<'t> FnMut(&'t mut dyn Transaction) -> TxFuture<'t, T> + Send,
{
    for attempt in 1..=max_attempts {
        let mut tx = store.begin().await?;
        let value = work(tx.as_mut()).await?;
        match tx.commit().await {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict) => {
                tracing::debug!(attempt, max_attempts, "transaction conflict, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(PipelineError::RetriesExhausted {
        attempts: max_attempts,
    }
    .into())
}

/// Run a query to exhaustion and deserialize every entity, attaching keys.
pub async fn load_all<T>(store: &dyn KeyValueStore, query: Query) -> anyhow::Result<Vec<T>>
where
    T: DeserializeOwned + HasAssignableKey,
{
    let mut query = query;
    query.keys_only = false;
    let mut out = Vec::new();
    loop {
        let page = store.query(&query).await?;
        for entry in page.entries {
            let Some(entity) = entry.entity else {
                continue;
            };
            match from_entity::<T>(entity) {
                Ok(mut item) => {
                    item.set_key(entry.key);
                    out.push(item);
                }
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "skipping undecodable entity");
                }
            }
        }
        if page.done || page.cursor.is_none() {
            break;
        }
        query.start = page.cursor;
    }
    Ok(out)
}
