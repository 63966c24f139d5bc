//! In-memory [`KeyValueStore`] implementation for tests and local runs.
//!
//! Entities live in a `BTreeMap` behind `std::sync::RwLock`, each with a
//! version counter that backs optimistic transactions. Cursors encode the
//! sort position of the last returned entry, so pages stay correct when
//! entities are added or removed between invocations.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Key;

use super::{
    Cursor, Entity, KeyValueStore, Order, Query, QueryEntry, QueryPage, StoreError, Transaction,
};

struct Versioned {
    version: u64,
    entity: Entity,
}

#[derive(Default)]
struct Shared {
    entities: RwLock<BTreeMap<Key, Versioned>>,
    /// Number of upcoming commits to fail with a conflict.
    injected_conflicts: AtomicU32,
    /// Number of upcoming queries to fail with a backend error.
    injected_query_failures: AtomicU32,
}

/// In-memory store for tests and single-process runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` transaction commits fail with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, n: u32) {
        self.shared.injected_conflicts.store(n, AtomicOrdering::SeqCst);
    }

    /// Make the next `n` queries fail with [`StoreError::Backend`].
    pub fn inject_query_failures(&self, n: u32) {
        self.shared
            .injected_query_failures
            .store(n, AtomicOrdering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.shared.entities.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("store lock poisoned".to_string())
}

#[derive(Serialize, Deserialize)]
struct CursorPos {
    #[serde(default)]
    v: Value,
    k: String,
}

fn encode_cursor(sort_value: &Value, key: &Key) -> Cursor {
    let pos = CursorPos {
        v: sort_value.clone(),
        k: key.encode(),
    };
    let json = serde_json::to_vec(&pos).unwrap_or_default();
    Cursor::new(URL_SAFE_NO_PAD.encode(json))
}

fn decode_cursor(cursor: &Cursor) -> Result<(Value, Key), StoreError> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor.as_str())
        .map_err(|e| StoreError::Cursor(e.to_string()))?;
    let pos: CursorPos =
        serde_json::from_slice(&raw).map_err(|e| StoreError::Cursor(e.to_string()))?;
    let key = Key::decode(&pos.k).map_err(|e| StoreError::Cursor(e.to_string()))?;
    Ok((pos.v, key))
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type first, then by value.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare two `(sort value, key)` positions under `order`.
fn compare_positions(order: Option<&Order>, a: (&Value, &Key), b: (&Value, &Key)) -> Ordering {
    match order {
        None => a.1.cmp(b.1),
        Some(Order::Asc(_)) => compare_values(a.0, b.0).then_with(|| a.1.cmp(b.1)),
        Some(Order::Desc(_)) => compare_values(b.0, a.0).then_with(|| a.1.cmp(b.1)),
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &Key) -> Result<Entity, StoreError> {
        let entities = self.shared.entities.read().map_err(poisoned)?;
        entities
            .get(key)
            .map(|v| v.entity.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn get_multi(&self, keys: &[Key]) -> Result<Vec<Result<Entity, StoreError>>, StoreError> {
        let entities = self.shared.entities.read().map_err(poisoned)?;
        Ok(keys
            .iter()
            .map(|k| {
                entities
                    .get(k)
                    .map(|v| v.entity.clone())
                    .ok_or(StoreError::NotFound)
            })
            .collect())
    }

    async fn put(&self, key: &Key, entity: Entity) -> Result<(), StoreError> {
        self.put_multi(vec![(key.clone(), entity)]).await
    }

    async fn put_multi(&self, entries: Vec<(Key, Entity)>) -> Result<(), StoreError> {
        let mut entities = self.shared.entities.write().map_err(poisoned)?;
        for (key, entity) in entries {
            let version = entities.get(&key).map(|v| v.version).unwrap_or(0) + 1;
            entities.insert(key, Versioned { version, entity });
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.delete_multi(std::slice::from_ref(key)).await
    }

    async fn delete_multi(&self, keys: &[Key]) -> Result<(), StoreError> {
        let mut entities = self.shared.entities.write().map_err(poisoned)?;
        for key in keys {
            entities.remove(key);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        if self
            .shared
            .injected_query_failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend("injected query failure".to_string()));
        }
        let start = query.start.as_ref().map(decode_cursor).transpose()?;
        let entities = self.shared.entities.read().map_err(poisoned)?;
        let order = query.order.as_ref();

        let mut matches: Vec<(Value, &Key, &Entity)> = entities
            .iter()
            .filter(|(k, _)| k.kind == query.kind)
            .filter(|(_, v)| {
                query
                    .filters
                    .iter()
                    .all(|f| v.entity.get(&f.field) == Some(&f.value))
            })
            .map(|(k, v)| {
                let sort_value = order
                    .and_then(|o| v.entity.get(o.field()).cloned())
                    .unwrap_or(Value::Null);
                (sort_value, k, &v.entity)
            })
            .collect();
        if order.is_some() {
            matches.sort_by(|a, b| compare_positions(order, (&a.0, a.1), (&b.0, b.1)));
        }

        let mut remaining = matches.into_iter().filter(|(v, k, _)| match &start {
            Some((sv, sk)) => compare_positions(order, (v, *k), (sv, sk)) == Ordering::Greater,
            None => true,
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();
        let mut last_pos = None;
        for (sort_value, key, entity) in remaining.by_ref().take(limit) {
            last_pos = Some((sort_value, key.clone()));
            entries.push(QueryEntry {
                key: key.clone(),
                entity: if query.keys_only {
                    None
                } else {
                    Some(entity.clone())
                },
            });
        }
        let done = remaining.next().is_none();
        let cursor = match last_pos {
            Some((v, k)) => Some(encode_cursor(&v, &k)),
            None => query.start.clone(),
        };

        Ok(QueryPage {
            entries,
            cursor,
            done,
        })
    }

    async fn kinds(&self) -> Result<Vec<String>, StoreError> {
        let entities = self.shared.entities.read().map_err(poisoned)?;
        let mut kinds: Vec<String> = entities.keys().map(|k| k.kind.clone()).collect();
        kinds.dedup();
        Ok(kinds)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            reads: HashMap::new(),
            writes: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    /// Version observed per key read; 0 means absent.
    reads: HashMap<Key, u64>,
    writes: Vec<(Key, Entity)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_multi(&mut self, keys: &[Key]) -> Result<Vec<Option<Entity>>, StoreError> {
        let entities = self.shared.entities.read().map_err(poisoned)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let found = entities.get(key);
            self.reads
                .entry(key.clone())
                .or_insert_with(|| found.map(|v| v.version).unwrap_or(0));
            out.push(found.map(|v| v.entity.clone()));
        }
        Ok(out)
    }

    fn put(&mut self, key: Key, entity: Entity) {
        self.writes.push((key, entity));
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let injected = self.shared.injected_conflicts.load(AtomicOrdering::SeqCst);
        if injected > 0 {
            self.shared
                .injected_conflicts
                .store(injected - 1, AtomicOrdering::SeqCst);
            return Err(StoreError::Conflict);
        }

        let mut entities = self.shared.entities.write().map_err(poisoned)?;
        for (key, seen) in &self.reads {
            let current = entities.get(key).map(|v| v.version).unwrap_or(0);
            if current != *seen {
                return Err(StoreError::Conflict);
            }
        }
        for (key, entity) in self.writes {
            let version = entities.get(&key).map(|v| v.version).unwrap_or(0) + 1;
            entities.insert(key, Versioned { version, entity });
        }
        Ok(())
    }
}
