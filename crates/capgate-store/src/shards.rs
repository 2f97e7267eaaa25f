//! Named collection of backing-store shards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use capgate_core::SharedClock;

use crate::backend::KeyValueStore;
use crate::memory::MemoryStore;

/// Shards addressed by name.
#[derive(Clone, Default)]
pub struct Shards {
    by_name: BTreeMap<String, Arc<dyn KeyValueStore>>,
}

impl fmt::Debug for Shards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}

impl Shards {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `count` in-memory shards named `shard-0` .. `shard-{count-1}`.
    #[must_use]
    pub fn in_memory(count: usize, clock: &SharedClock) -> Self {
        let mut shards = Self::new();
        for i in 0..count {
            shards.insert(Arc::new(MemoryStore::new(format!("shard-{i}"), clock.clone())));
        }
        shards
    }

    /// Adds a shard under its own name, replacing any previous one.
    pub fn insert(&mut self, store: Arc<dyn KeyValueStore>) {
        self.by_name.insert(store.name().to_string(), store);
    }

    /// Looks up a shard.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyValueStore>> {
        self.by_name.get(name).cloned()
    }

    /// Shard names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_name.keys().map(String::as_str)
    }

    /// Iterates shards in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn KeyValueStore>> + '_ {
        self.by_name.values()
    }

    /// Number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns true when there are no shards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use capgate_core::FakeClock;
    use chrono::Utc;

    use super::*;

    #[test]
    fn in_memory_names_shards_in_order() {
        let clock: SharedClock = FakeClock::shared(Utc::now());
        let shards = Shards::in_memory(3, &clock);
        assert_eq!(shards.len(), 3);
        assert_eq!(
            shards.names().collect::<Vec<_>>(),
            vec!["shard-0", "shard-1", "shard-2"]
        );
        assert!(shards.get("shard-1").is_some());
        assert!(shards.get("shard-9").is_none());
    }
}
