//! Behavioural tests for the SQLite queue, cache and store backends.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use autotown::config::Config;
use autotown::sqlite_cache::SqliteCache;
use autotown::sqlite_queue::SqliteQueue;
use autotown::sqlite_store::SqliteStore;
use autotown::{db, migrate};
use autotown_core::cache::Cache;
use autotown_core::queue::{QueueError, Task, WorkQueue, MAX_BATCH};
use autotown_core::store::{KeyValueStore, Query, StoreError};
use autotown_core::Key;

async fn pool() -> (TempDir, sqlx::SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db(tmp.path().join("backends.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    (tmp, pool)
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, pool) = pool().await;
    migrate::migrate_pool(&pool).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
}

#[tokio::test]
async fn test_migration_adds_lease_column_to_old_tasks_table() {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db(tmp.path().join("old.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    sqlx::query(
        "CREATE TABLE tasks (id INTEGER PRIMARY KEY AUTOINCREMENT, queue TEXT NOT NULL, \
         path TEXT NOT NULL, payload BLOB NOT NULL, params_json TEXT NOT NULL DEFAULT '{}', \
         retry_count INTEGER NOT NULL DEFAULT 0, enqueued_at INTEGER NOT NULL)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO tasks (queue, path, payload, enqueued_at) VALUES ('map2', '/batch/logkeys', x'', 0)")
        .execute(&pool)
        .await
        .unwrap();

    migrate::migrate_pool(&pool).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let queue = SqliteQueue::new(pool);
    let lease = queue.pop("map2").await.unwrap().unwrap();
    assert_eq!(lease.task.path, "/batch/logkeys");
    queue.ack("map2", lease.id).await.unwrap();
    assert_eq!(queue.stats("map2").await.unwrap().tasks, 0);
}

#[tokio::test]
async fn test_queue_is_fifo_and_keeps_params() {
    let (_tmp, pool) = pool().await;
    let queue = SqliteQueue::new(pool);

    let mut params = BTreeMap::new();
    params.insert("kind".to_string(), "FoundController".to_string());
    let mut retried = Task::with_payload("/batch/logkeys", vec![1, 2, 3]);
    retried.retry_count = 4;

    queue.enqueue("map", Task::with_params("/batch/map", params.clone())).await.unwrap();
    queue.enqueue("map", retried.clone()).await.unwrap();
    queue.enqueue("other", Task::default()).await.unwrap();

    assert_eq!(queue.stats("map").await.unwrap().tasks, 2);
    let first = queue.pop("map").await.unwrap().unwrap();
    assert_eq!(first.task.path, "/batch/map");
    assert_eq!(first.task.params, params);
    let second = queue.pop("map").await.unwrap().unwrap();
    assert_eq!(second.task, retried);
    assert!(queue.pop("map").await.unwrap().is_none());

    queue.ack("map", first.id).await.unwrap();
    queue.ack("map", second.id).await.unwrap();
    let depths = queue.depths().await.unwrap();
    assert_eq!(depths, vec![("other".to_string(), 1)]);
}

#[tokio::test]
async fn test_unacked_task_survives_until_lease_expires() {
    let (_tmp, pool) = pool().await;
    let held = SqliteQueue::new(pool.clone());
    let expiring = SqliteQueue::new(pool).with_lease(Duration::ZERO);

    held.enqueue("map2", Task::with_payload("/batch/logkeys", vec![1])).await.unwrap();
    let lease = held.pop("map2").await.unwrap().unwrap();
    assert_eq!(lease.task.retry_count, 0);
    assert!(held.pop("map2").await.unwrap().is_none());
    assert!(expiring.pop("map2").await.unwrap().is_none());
    assert_eq!(held.stats("map2").await.unwrap().tasks, 1);

    // Claimed with an instant deadline and never acked.
    expiring.enqueue("map2", Task::with_payload("/batch/logkeys", vec![2])).await.unwrap();
    let abandoned = expiring.pop("map2").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let redelivered = expiring.pop("map2").await.unwrap().unwrap();
    assert_eq!(redelivered.id, abandoned.id);
    assert_eq!(redelivered.task.payload, vec![2]);
    assert_eq!(redelivered.task.retry_count, 1);

    expiring.ack("map2", redelivered.id).await.unwrap();
    held.ack("map2", lease.id).await.unwrap();
    assert_eq!(held.stats("map2").await.unwrap().tasks, 0);
}

#[tokio::test]
async fn test_queue_rejects_oversized_batch() {
    let (_tmp, pool) = pool().await;
    let queue = SqliteQueue::new(pool);
    let tasks = vec![Task::with_payload("/x", vec![]); MAX_BATCH + 1];
    let err = queue.enqueue_multi("map2", tasks).await.unwrap_err();
    assert!(matches!(err, QueueError::TooManyTasks { .. }));
    assert_eq!(queue.stats("map2").await.unwrap().tasks, 0);

    let tasks = vec![Task::with_payload("/x", vec![]); MAX_BATCH];
    queue.enqueue_multi("map2", tasks).await.unwrap();
    assert_eq!(queue.stats("map2").await.unwrap().tasks, MAX_BATCH);
}

#[tokio::test]
async fn test_cache_entries_expire() {
    let (_tmp, pool) = pool().await;
    let cache = SqliteCache::new(pool);

    cache.set("forever", b"a".to_vec(), None).await.unwrap();
    cache
        .set("brief", b"b".to_vec(), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(cache.get("brief").await.unwrap(), Some(b"b".to_vec()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get("brief").await.unwrap(), None);
    assert_eq!(cache.get("forever").await.unwrap(), Some(b"a".to_vec()));

    cache.delete("forever").await.unwrap();
    assert_eq!(cache.get("forever").await.unwrap(), None);
}

#[tokio::test]
async fn test_store_get_multi_reports_each_key() {
    let (_tmp, pool) = pool().await;
    let store = SqliteStore::new(pool);
    let present = Key::new("UsageStat", "a");
    let absent = Key::new("UsageStat", "b");
    store.put(&present, json!({"addr": "1.2.3.4"})).await.unwrap();

    let results = store.get_multi(&[absent.clone(), present.clone()]).await.unwrap();
    assert!(matches!(results[0], Err(StoreError::NotFound)));
    assert_eq!(results[1].as_ref().unwrap()["addr"], "1.2.3.4");

    store.delete_multi(&[present.clone(), absent]).await.unwrap();
    assert!(matches!(store.get(&present).await, Err(StoreError::NotFound)));
}

#[tokio::test]
async fn test_store_filters_and_counts_kinds() {
    let (_tmp, pool) = pool().await;
    let store = SqliteStore::new(pool);
    for (name, os) in [("a", "Linux"), ("b", "Windows"), ("c", "Linux")] {
        store
            .put(&Key::new("FoundController", name), json!({"gcs_os": os}))
            .await
            .unwrap();
    }
    store.put(&Key::new("DailyCounts", "d"), json!({})).await.unwrap();

    let page = store
        .query(&Query::new("FoundController").filter("gcs_os", json!("Linux")))
        .await
        .unwrap();
    let names: Vec<_> = page.entries.iter().map(|e| e.key.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
    assert!(page.done);

    assert_eq!(
        store.kinds().await.unwrap(),
        vec!["DailyCounts".to_string(), "FoundController".to_string()]
    );
    assert_eq!(
        store.counts_by_kind().await.unwrap(),
        vec![("DailyCounts".to_string(), 1), ("FoundController".to_string(), 3)]
    );
}

#[tokio::test]
async fn test_store_rejects_foreign_cursor() {
    let (_tmp, pool) = pool().await;
    let store = SqliteStore::new(pool);
    let query = Query::new("FoundController").start(Some(autotown_core::store::Cursor::new("!!")));
    assert!(matches!(store.query(&query).await, Err(StoreError::Cursor(_))));
}
