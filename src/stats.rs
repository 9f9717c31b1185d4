//! Statistics registry
//!
//! Writers publish their counters here under a name and a set of tags. The
//! registry is owned by the [`Service`](crate::service::Service) that created
//! it, so independent services never share counters.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// A live integer value read on demand
pub trait IntVar: Send + Sync {
    /// Current value
    fn int_value(&self) -> i64;
}

impl IntVar for AtomicI64 {
    fn int_value(&self) -> i64 {
        self.load(Ordering::Relaxed)
    }
}

/// Named values of one statistic
#[derive(Default)]
pub struct StatMap {
    values: RwLock<BTreeMap<String, Arc<dyn IntVar>>>,
}

impl StatMap {
    /// Publish `var` under `name`, replacing any previous value
    pub fn set(&self, name: impl Into<String>, var: Arc<dyn IntVar>) {
        self.values.write().insert(name.into(), var);
    }

    /// Read a single value
    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.read().get(name).map(|var| var.int_value())
    }

    /// Read every value
    pub fn values(&self) -> BTreeMap<String, i64> {
        self.values
            .read()
            .iter()
            .map(|(name, var)| (name.clone(), var.int_value()))
            .collect()
    }
}

/// Point-in-time copy of one statistic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistic {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub values: BTreeMap<String, i64>,
}

struct Entry {
    name: String,
    tags: BTreeMap<String, String>,
    values: Arc<StatMap>,
}

/// Registry of published statistics
#[derive(Default)]
pub struct StatsRegistry {
    next_key: AtomicU64,
    entries: DashMap<String, Entry>,
}

impl StatsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statistic. The returned key is unique for the lifetime of
    /// the registry and is used to delete the statistic again.
    pub fn new_statistic(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> (String, Arc<StatMap>) {
        let id = self.next_key.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}-{}", name, id);
        let values = Arc::new(StatMap::default());
        self.entries.insert(
            key.clone(),
            Entry {
                name: name.to_string(),
                tags,
                values: Arc::clone(&values),
            },
        );
        (key, values)
    }

    /// Remove a statistic, no-op for unknown keys
    pub fn delete_statistic(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Copy out every statistic, ordered by name then tags
    pub fn snapshot(&self) -> Vec<Statistic> {
        let mut stats: Vec<Statistic> = self
            .entries
            .iter()
            .map(|entry| Statistic {
                name: entry.name.clone(),
                tags: entry.tags.clone(),
                values: entry.values.values(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        stats
    }

    /// Number of registered statistics
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
