//! Keys written on the source shard while a migration copies it.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe set of keys that must be copied again.
#[derive(Debug, Default)]
pub struct DirtyKeyTracker {
    keys: Mutex<BTreeSet<String>>,
}

impl DirtyKeyTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one key.
    pub fn mark(&self, key: impl Into<String>) {
        self.lock().insert(key.into());
    }

    /// Marks every key in `keys`.
    pub fn mark_all<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut set = self.lock();
        set.extend(keys.into_iter().map(Into::into));
    }

    /// Takes every marked key, in key order.
    #[must_use]
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    /// Number of marked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true when nothing is marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
