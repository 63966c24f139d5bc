//! Application context shared by every stage handler.
//!
//! [`Services`] bundles the store, queue, cache and notifier ports with the
//! tunables a stage needs. It is built once at start-up and passed by
//! reference; nothing in the pipeline reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::merge::Notifier;
use crate::queue::{WorkQueue, MAX_BATCH};
use crate::sighting::AliasTable;
use crate::store::KeyValueStore;

/// Names of the queues the pipeline submits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Paginator self-resubmission.
    pub map: String,
    /// Dispatched key chunks; its depth drives backpressure.
    pub work: String,
    /// Accepted usage submissions awaiting storage.
    pub usage: String,
    /// Envelopes awaiting the rollup.
    pub rollup: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            map: "map".to_string(),
            work: "map2".to_string(),
            usage: "asyncusage".to_string(),
            rollup: "asyncRollupBE".to_string(),
        }
    }
}

impl QueueNames {
    pub fn all(&self) -> [&str; 4] {
        [&self.map, &self.work, &self.usage, &self.rollup]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    /// Keys enumerated per paginator invocation.
    pub page_limit: usize,
    /// Work queue depth at which new pages are refused.
    pub resubmit_threshold: usize,
    /// Keys per dispatched task, at most [`MAX_BATCH`].
    pub chunk_size: usize,
    /// Concurrent store or queue calls inside one invocation.
    pub concurrency: usize,
    /// Records per counter transaction.
    pub tx_group_size: usize,
    pub tx_attempts: u32,
    pub summary_ttl: Duration,
    pub recent_limit: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            page_limit: 10_000,
            resubmit_threshold: 1_000,
            chunk_size: MAX_BATCH,
            concurrency: 8,
            tx_group_size: 10,
            tx_attempts: 10,
            summary_ttl: Duration::from_secs(3600),
            recent_limit: 256,
        }
    }
}

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn KeyValueStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub cache: Arc<dyn Cache>,
    pub notifier: Arc<dyn Notifier>,
    pub queues: QueueNames,
    pub settings: BatchSettings,
    pub aliases: AliasTable,
}

impl Services {
    /// Context with default queue names, settings and aliases.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: Arc<dyn WorkQueue>,
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            notifier,
            queues: QueueNames::default(),
            settings: BatchSettings::default(),
            aliases: AliasTable::default(),
        }
    }

    pub fn with_settings(mut self, settings: BatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_queues(mut self, queues: QueueNames) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }
}
