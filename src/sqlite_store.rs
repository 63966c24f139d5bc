//! SQLite-backed [`KeyValueStore`].
//!
//! Entities live in one `entities` table as JSON text keyed by
//! `(kind, name)`. Field ordering and equality filters are evaluated with
//! `json_extract`, so queries need no per-kind schema.
//!
//! Transactions are optimistic: reads record the row version they saw, and
//! commit applies each write as a version-guarded statement inside one SQL
//! transaction. Any guard that matches no row aborts with
//! [`StoreError::Conflict`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use autotown_core::models::Key;
use autotown_core::store::{
    Cursor, Entity, KeyValueStore, Order, Query, QueryEntry, QueryPage, StoreError, Transaction,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of stored entities per kind.
    pub async fn counts_by_kind(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM entities GROUP BY kind ORDER BY kind")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("kind"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// Bind a JSON scalar the way `json_extract` reports it.
fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Bool(b) => {
            qb.push_bind(i64::from(*b));
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        other => {
            qb.push_bind(other.to_string());
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Position {
    #[serde(default)]
    v: Value,
    n: String,
}

fn encode_cursor(position: &Position) -> Result<Cursor, StoreError> {
    Ok(Cursor::new(URL_SAFE_NO_PAD.encode(serde_json::to_vec(position)?)))
}

fn decode_cursor(cursor: &Cursor) -> Result<Position, StoreError> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor.as_str())
        .map_err(|e| StoreError::Cursor(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| StoreError::Cursor(e.to_string()))
}

fn parse_body(body: &str) -> Result<Entity, StoreError> {
    Ok(serde_json::from_str(body)?)
}

async fn read_versioned(
    pool: &SqlitePool,
    key: &Key,
) -> Result<Option<(Entity, i64)>, StoreError> {
    let row = sqlx::query("SELECT body, version FROM entities WHERE kind = ? AND name = ?")
        .bind(&key.kind)
        .bind(&key.name)
        .fetch_optional(pool)
        .await
        .map_err(backend)?;
    match row {
        Some(row) => {
            let body: String = row.get("body");
            Ok(Some((parse_body(&body)?, row.get("version"))))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &Key) -> Result<Entity, StoreError> {
        read_versioned(&self.pool, key)
            .await?
            .map(|(entity, _)| entity)
            .ok_or(StoreError::NotFound)
    }

    async fn get_multi(&self, keys: &[Key]) -> Result<Vec<Result<Entity, StoreError>>, StoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(match read_versioned(&self.pool, key).await {
                Ok(Some((entity, _))) => Ok(entity),
                Ok(None) => Err(StoreError::NotFound),
                Err(StoreError::Backend(e)) => return Err(StoreError::Backend(e)),
                Err(e) => Err(e),
            });
        }
        Ok(out)
    }

    async fn put(&self, key: &Key, entity: Entity) -> Result<(), StoreError> {
        self.put_multi(vec![(key.clone(), entity)]).await
    }

    async fn put_multi(&self, entries: Vec<(Key, Entity)>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for (key, entity) in entries {
            upsert(&mut tx, &key, &serde_json::to_string(&entity)?).await?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.delete_multi(std::slice::from_ref(key)).await
    }

    async fn delete_multi(&self, keys: &[Key]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for key in keys {
            sqlx::query("DELETE FROM entities WHERE kind = ? AND name = ?")
                .bind(&key.kind)
                .bind(&key.name)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT name, ");
        qb.push(if query.keys_only { "NULL" } else { "body" });
        qb.push(" AS body, ");
        match &query.order {
            Some(order) => {
                qb.push("json_quote(json_extract(body, ");
                qb.push_bind(json_path(order.field()));
                qb.push(")) AS sort_json");
            }
            None => {
                qb.push("'null' AS sort_json");
            }
        }
        qb.push(" FROM entities WHERE kind = ");
        qb.push_bind(query.kind.clone());

        for filter in &query.filters {
            qb.push(" AND json_extract(body, ");
            qb.push_bind(json_path(&filter.field));
            qb.push(") = ");
            push_value(&mut qb, &filter.value);
        }

        if let Some(cursor) = &query.start {
            let position = decode_cursor(cursor)?;
            match &query.order {
                None => {
                    qb.push(" AND name > ");
                    qb.push_bind(position.n);
                }
                Some(order) => {
                    let op = match order {
                        Order::Asc(_) => " > ",
                        Order::Desc(_) => " < ",
                    };
                    let path = json_path(order.field());
                    qb.push(" AND (json_extract(body, ");
                    qb.push_bind(path.clone());
                    qb.push(")");
                    qb.push(op);
                    push_value(&mut qb, &position.v);
                    qb.push(" OR (json_extract(body, ");
                    qb.push_bind(path);
                    qb.push(") = ");
                    push_value(&mut qb, &position.v);
                    qb.push(" AND name > ");
                    qb.push_bind(position.n);
                    qb.push("))");
                }
            }
        }

        match &query.order {
            None => {
                qb.push(" ORDER BY name");
            }
            Some(order) => {
                qb.push(" ORDER BY json_extract(body, ");
                qb.push_bind(json_path(order.field()));
                qb.push(match order {
                    Order::Asc(_) => ") ASC, name ASC",
                    Order::Desc(_) => ") DESC, name ASC",
                });
            }
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64 + 1);
        }

        let mut rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;
        let done = match query.limit {
            Some(limit) if rows.len() > limit => {
                rows.truncate(limit);
                false
            }
            _ => true,
        };

        let mut entries = Vec::with_capacity(rows.len());
        let mut last: Option<Position> = None;
        for row in &rows {
            let name: String = row.get("name");
            let sort_json: Option<String> = row.get("sort_json");
            let entity = if query.keys_only {
                None
            } else {
                let body: String = row.get("body");
                Some(parse_body(&body)?)
            };
            last = Some(Position {
                v: sort_json
                    .as_deref()
                    .map(serde_json::from_str::<Value>)
                    .transpose()?
                    .unwrap_or(Value::Null),
                n: name.clone(),
            });
            entries.push(QueryEntry {
                key: Key::new(query.kind.clone(), name),
                entity,
            });
        }

        let cursor = match last {
            Some(position) => Some(encode_cursor(&position)?),
            None => query.start.clone(),
        };
        Ok(QueryPage {
            entries,
            cursor,
            done,
        })
    }

    async fn kinds(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT kind FROM entities ORDER BY kind")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().map(|row| row.get("kind")).collect())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(SqliteTransaction {
            pool: self.pool.clone(),
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }
}

async fn upsert(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    key: &Key,
    body: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO entities (kind, name, body, version)
        VALUES (?, ?, ?, 1)
        ON CONFLICT(kind, name) DO UPDATE SET
            body = excluded.body,
            version = entities.version + 1
        "#,
    )
    .bind(&key.kind)
    .bind(&key.name)
    .bind(body)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;
    Ok(())
}

struct SqliteTransaction {
    pool: SqlitePool,
    /// Version observed per key read; 0 means absent.
    reads: HashMap<Key, i64>,
    /// Last write per key wins.
    writes: BTreeMap<Key, Entity>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn get_multi(&mut self, keys: &[Key]) -> Result<Vec<Option<Entity>>, StoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let found = read_versioned(&self.pool, key).await?;
            let version = found.as_ref().map(|(_, v)| *v).unwrap_or(0);
            self.reads.entry(key.clone()).or_insert(version);
            out.push(found.map(|(entity, _)| entity));
        }
        Ok(out)
    }

    fn put(&mut self, key: Key, entity: Entity) {
        self.writes.insert(key, entity);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Guarded writes first, so the write lock is held before the
        // read-only version checks run.
        for (key, entity) in &self.writes {
            let body = serde_json::to_string(entity)?;
            let affected = match self.reads.get(key) {
                None => {
                    upsert(&mut tx, key, &body).await?;
                    1
                }
                Some(0) => sqlx::query(
                    "INSERT INTO entities (kind, name, body, version) VALUES (?, ?, ?, 1) \
                     ON CONFLICT(kind, name) DO NOTHING",
                )
                .bind(&key.kind)
                .bind(&key.name)
                .bind(&body)
                .execute(&mut *tx)
                .await
                .map_err(backend)?
                .rows_affected(),
                Some(seen) => sqlx::query(
                    "UPDATE entities SET body = ?, version = version + 1 \
                     WHERE kind = ? AND name = ? AND version = ?",
                )
                .bind(&body)
                .bind(&key.kind)
                .bind(&key.name)
                .bind(seen)
                .execute(&mut *tx)
                .await
                .map_err(backend)?
                .rows_affected(),
            };
            if affected == 0 {
                return Err(StoreError::Conflict);
            }
        }

        for (key, seen) in &self.reads {
            if self.writes.contains_key(key) {
                continue;
            }
            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM entities WHERE kind = ? AND name = ?")
                    .bind(&key.kind)
                    .bind(&key.name)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(backend)?;
            if current.unwrap_or(0) != *seen {
                return Err(StoreError::Conflict);
            }
        }

        tx.commit().await.map_err(backend)
    }
}
