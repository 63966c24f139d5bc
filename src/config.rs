//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the pipeline
//! defaults. [`load_config`] parses and validates; the accessors convert the
//! file's shape into the core crate's [`BatchSettings`], [`QueueNames`] and
//! [`AliasTable`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use autotown_core::queue::{DEFAULT_LEASE, MAX_BATCH};
use autotown_core::sighting::AliasTable;
use autotown_core::{BatchSettings, QueueNames};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Extra display-name aliases, merged over the built-in table.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueuesConfig {
    #[serde(default = "default_map_queue")]
    pub map: String,
    #[serde(default = "default_work_queue")]
    pub work: String,
    #[serde(default = "default_usage_queue")]
    pub usage: String,
    #[serde(default = "default_rollup_queue")]
    pub rollup: String,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            map: default_map_queue(),
            work: default_work_queue(),
            usage: default_usage_queue(),
            rollup: default_rollup_queue(),
        }
    }
}

fn default_map_queue() -> String {
    "map".to_string()
}
fn default_work_queue() -> String {
    "map2".to_string()
}
fn default_usage_queue() -> String {
    "asyncusage".to_string()
}
fn default_rollup_queue() -> String {
    "asyncRollupBE".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default = "default_resubmit_threshold")]
    pub resubmit_threshold: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_tx_group_size")]
    pub tx_group_size: usize,
    #[serde(default = "default_tx_attempts")]
    pub tx_attempts: u32,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            resubmit_threshold: default_resubmit_threshold(),
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            tx_group_size: default_tx_group_size(),
            tx_attempts: default_tx_attempts(),
            recent_limit: default_recent_limit(),
        }
    }
}

fn default_page_limit() -> usize {
    10_000
}
fn default_resubmit_threshold() -> usize {
    1_000
}
fn default_chunk_size() -> usize {
    MAX_BATCH
}
fn default_concurrency() -> usize {
    8
}
fn default_tx_group_size() -> usize {
    10
}
fn default_tx_attempts() -> u32 {
    10
}
fn default_recent_limit() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Failed deliveries before a task is dropped.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    /// Exit once every queue is empty instead of polling.
    #[serde(default = "default_idle_exit")]
    pub idle_exit: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds a popped task stays hidden before it is redelivered.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_task_retries: default_max_task_retries(),
            idle_exit: default_idle_exit(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_max_task_retries() -> u32 {
    5
}
fn default_idle_exit() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE.as_secs()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_summary_ttl_secs")]
    pub summary_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            summary_ttl_secs: default_summary_ttl_secs(),
        }
    }
}

fn default_summary_ttl_secs() -> u64 {
    3600
}

impl Config {
    /// Defaults everywhere, with the database at `db_path`.
    pub fn with_db(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            queues: QueuesConfig::default(),
            batch: BatchConfig::default(),
            worker: WorkerConfig::default(),
            cache: CacheConfig::default(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            page_limit: self.batch.page_limit,
            resubmit_threshold: self.batch.resubmit_threshold,
            chunk_size: self.batch.chunk_size,
            concurrency: self.batch.concurrency,
            tx_group_size: self.batch.tx_group_size,
            tx_attempts: self.batch.tx_attempts,
            summary_ttl: Duration::from_secs(self.cache.summary_ttl_secs),
            recent_limit: self.batch.recent_limit,
        }
    }

    pub fn queue_names(&self) -> QueueNames {
        QueueNames {
            map: self.queues.map.clone(),
            work: self.queues.work.clone(),
            usage: self.queues.usage.clone(),
            rollup: self.queues.rollup.clone(),
        }
    }

    pub fn alias_table(&self) -> AliasTable {
        AliasTable::with_extra(self.aliases.clone())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let batch = &config.batch;
    for (name, value) in [
        ("batch.page_limit", batch.page_limit),
        ("batch.resubmit_threshold", batch.resubmit_threshold),
        ("batch.chunk_size", batch.chunk_size),
        ("batch.concurrency", batch.concurrency),
        ("batch.tx_group_size", batch.tx_group_size),
        ("batch.recent_limit", batch.recent_limit),
    ] {
        if value == 0 {
            bail!("{name} must be > 0");
        }
    }
    if batch.tx_attempts == 0 {
        bail!("batch.tx_attempts must be > 0");
    }
    if batch.chunk_size > MAX_BATCH {
        bail!("batch.chunk_size must be <= {MAX_BATCH}");
    }
    if config.worker.lease_secs == 0 {
        bail!("worker.lease_secs must be > 0");
    }

    let queues = &config.queues;
    for (name, value) in [
        ("queues.map", &queues.map),
        ("queues.work", &queues.work),
        ("queues.usage", &queues.usage),
        ("queues.rollup", &queues.rollup),
    ] {
        if value.trim().is_empty() {
            bail!("{name} must not be empty");
        }
    }
    if queues.map == queues.work {
        bail!("queues.map and queues.work must differ");
    }

    Ok(())
}
