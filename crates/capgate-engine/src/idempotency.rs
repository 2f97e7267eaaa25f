//! Process-local replay cache in front of the store's idempotency records.
//!
//! The authoritative record lives in the store (`{p:acct}:ik:<op>:<hash>`)
//! and is written by the same script that performs the operation. This
//! cache only remembers responses this process already produced, so a
//! retry of a finished call never leaves the process. It shares the
//! store-side TTL and the injected clock.

use std::time::Duration;

use capgate_core::{AccountId, SharedClock};
use dashmap::DashMap;

/// Entries above which an insert sweeps expired ones.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at_ms: i64,
}

/// Memoized responses keyed by `(account, caller idempotency key)`.
#[derive(Debug)]
pub struct LocalIdempotencyCache<T> {
    entries: DashMap<(AccountId, String), Entry<T>>,
    ttl: Duration,
    clock: SharedClock,
}

impl<T: Clone> LocalIdempotencyCache<T> {
    /// Creates a cache; a zero TTL disables it.
    #[must_use]
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Returns true when the cache stores nothing.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.ttl.is_zero()
    }

    /// Returns the memoized response, if still fresh.
    #[must_use]
    pub fn get(&self, account: AccountId, key: &str) -> Option<T> {
        if self.is_disabled() || key.is_empty() {
            return None;
        }
        let now = self.clock.now_ms();
        let id = (account, key.to_string());
        let fresh = self
            .entries
            .get(&id)
            .filter(|e| e.expires_at_ms > now)
            .map(|e| e.value.clone());
        if fresh.is_none() {
            self.entries.remove_if(&id, |_, e| e.expires_at_ms <= now);
        }
        fresh
    }

    /// Memoizes a response.
    pub fn insert(&self, account: AccountId, key: &str, value: T) {
        if self.is_disabled() || key.is_empty() {
            return;
        }
        let now = self.clock.now_ms();
        if self.entries.len() >= SWEEP_THRESHOLD {
            self.entries.retain(|_, e| e.expires_at_ms > now);
        }
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        self.entries.insert(
            (account, key.to_string()),
            Entry {
                value,
                expires_at_ms: now.saturating_add(ttl_ms),
            },
        );
    }

    /// Number of entries, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use capgate_core::FakeClock;
    use chrono::Utc;

    use super::*;

    fn cache(ttl: Duration) -> (std::sync::Arc<FakeClock>, LocalIdempotencyCache<u32>) {
        let clock = FakeClock::shared(Utc::now());
        let shared: SharedClock = clock.clone();
        (clock, LocalIdempotencyCache::new(ttl, shared))
    }

    #[test]
    fn entries_expire_with_the_clock() {
        let (clock, cache) = cache(Duration::from_secs(10));
        let account = AccountId::generate();
        cache.insert(account, "k", 7);
        assert_eq!(cache.get(account, "k"), Some(7));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(cache.get(account, "k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_are_scoped_per_account() {
        let (_, cache) = cache(Duration::from_secs(10));
        let a = AccountId::generate();
        cache.insert(a, "k", 1);
        assert_eq!(cache.get(AccountId::generate(), "k"), None);
    }

    #[test]
    fn zero_ttl_and_empty_keys_store_nothing() {
        let (_, disabled) = cache(Duration::ZERO);
        let account = AccountId::generate();
        disabled.insert(account, "k", 1);
        assert!(disabled.is_empty());

        let (_, enabled) = cache(Duration::from_secs(1));
        enabled.insert(account, "", 1);
        assert!(enabled.is_empty());
    }
}
