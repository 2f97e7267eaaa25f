//! Short-lived negative cache in front of acquire.
//!
//! When an acquire reports a constraint as exhausted, further acquires that
//! include the same constraint are denied locally until the entry expires.
//! Only denials are cached: a stale entry costs a caller one retry, while a
//! cached grant could hand out capacity twice. Entries are never
//! invalidated early; a release simply lets the next miss re-probe.
//!
//! Which constraints qualify is decided by a [`ShouldCache`] predicate and
//! whether the cache applies to a caller by an [`AdmissionCacheEnable`]
//! predicate. Both are injectable.

use std::fmt;
use std::sync::Arc;

use capgate_core::{
    AccountId, AdmissionCacheConfig, ConstraintItem, EnvId, FunctionId, Scope, SharedClock,
    admission_cache_key,
};
use dashmap::DashMap;
use rand::Rng;

/// Decides whether a constraint's exhaustion may be cached.
pub trait ShouldCache: Send + Sync + fmt::Debug {
    /// Returns true when `constraint` may be served from the cache.
    fn should_cache(&self, constraint: &ConstraintItem) -> bool;
}

/// Caches scope-default concurrency at account and function scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultShouldCache;

impl ShouldCache for DefaultShouldCache {
    fn should_cache(&self, constraint: &ConstraintItem) -> bool {
        match constraint {
            ConstraintItem::Concurrency(c) => {
                !c.is_custom_key() && matches!(c.scope, Scope::Account | Scope::Function)
            }
            ConstraintItem::Throttle(_) | ConstraintItem::RateLimit(_) => false,
        }
    }
}

/// TTL window for one caller, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindow {
    /// Lower bound.
    pub min_ttl_ms: u64,
    /// Upper bound.
    pub max_ttl_ms: u64,
}

/// Decides whether the cache applies to a caller, and with which TTLs.
pub trait AdmissionCacheEnable: Send + Sync + fmt::Debug {
    /// Returns the TTL window, or `None` to bypass the cache.
    fn window(&self, account: AccountId, env: EnvId, function: FunctionId) -> Option<CacheWindow>;
}

impl AdmissionCacheEnable for AdmissionCacheConfig {
    fn window(&self, account: AccountId, _env: EnvId, _function: FunctionId) -> Option<CacheWindow> {
        if !self.enabled || self.max_ttl_ms == 0 {
            return None;
        }
        let account = account.to_string();
        if self.disabled_accounts.iter().any(|a| *a == account) {
            return None;
        }
        Some(CacheWindow {
            min_ttl_ms: self.min_ttl_ms.min(self.max_ttl_ms),
            max_ttl_ms: self.max_ttl_ms,
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    constraint: ConstraintItem,
    expires_at_ms: i64,
}

/// A cached denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    /// Constraints known to be exhausted, in canonical order.
    pub constraints: Vec<ConstraintItem>,
    /// Latest expiry among the matching entries, unix milliseconds.
    pub retry_at_ms: i64,
}

/// Concurrent negative cache of exhausted constraints.
#[derive(Debug)]
pub struct AdmissionCache {
    entries: DashMap<String, Entry>,
    should_cache: Arc<dyn ShouldCache>,
    enable: Arc<dyn AdmissionCacheEnable>,
    clock: SharedClock,
}

impl AdmissionCache {
    /// Creates a cache with the given predicates.
    #[must_use]
    pub fn new(
        clock: SharedClock,
        enable: Arc<dyn AdmissionCacheEnable>,
        should_cache: Arc<dyn ShouldCache>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            should_cache,
            enable,
            clock,
        }
    }

    /// Creates a cache driven by configuration and [`DefaultShouldCache`].
    #[must_use]
    pub fn from_config(clock: SharedClock, config: &AdmissionCacheConfig) -> Self {
        Self::new(clock, Arc::new(config.clone()), Arc::new(DefaultShouldCache))
    }

    /// Returns the cached denial covering any of `constraints`.
    #[must_use]
    pub fn lookup(
        &self,
        account: AccountId,
        env: EnvId,
        function: FunctionId,
        constraints: &[ConstraintItem],
    ) -> Option<CacheHit> {
        self.enable.window(account, env, function)?;
        let now = self.clock.now_ms();

        let mut hit = CacheHit {
            constraints: Vec::new(),
            retry_at_ms: now,
        };
        for constraint in constraints {
            if !self.should_cache.should_cache(constraint) {
                continue;
            }
            let key = admission_cache_key(constraint, account, env, function);
            let fresh = self
                .entries
                .get(&key)
                .filter(|e| e.expires_at_ms > now)
                .map(|e| (e.constraint.clone(), e.expires_at_ms));
            match fresh {
                Some((cached, expires_at_ms)) => {
                    hit.constraints.push(cached);
                    hit.retry_at_ms = hit.retry_at_ms.max(expires_at_ms);
                }
                None => {
                    self.entries.remove_if(&key, |_, e| e.expires_at_ms <= now);
                }
            }
        }

        if hit.constraints.is_empty() {
            return None;
        }
        hit.constraints.sort();
        Some(hit)
    }

    /// Records constraints an acquire reported as exhausted.
    ///
    /// Returns the number of entries written.
    pub fn record_exhausted(
        &self,
        account: AccountId,
        env: EnvId,
        function: FunctionId,
        exhausted: &[ConstraintItem],
    ) -> usize {
        let Some(window) = self.enable.window(account, env, function) else {
            return 0;
        };
        let now = self.clock.now_ms();
        let mut written = 0;
        for constraint in exhausted {
            if !self.should_cache.should_cache(constraint) {
                continue;
            }
            let ttl = if window.min_ttl_ms >= window.max_ttl_ms {
                window.max_ttl_ms
            } else {
                rand::thread_rng().gen_range(window.min_ttl_ms..=window.max_ttl_ms)
            };
            self.entries.insert(
                admission_cache_key(constraint, account, env, function),
                Entry {
                    constraint: constraint.clone(),
                    expires_at_ms: now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)),
                },
            );
            written += 1;
        }
        written
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
}

#[cfg(test)]
mod tests {
    use capgate_core::{Clock, FakeClock};
    use capgate_core::constraint::{ConcurrencyConstraint, ConcurrencyMode};
    use chrono::Utc;

    use super::*;

    fn ids() -> (AccountId, EnvId, FunctionId) {
        (AccountId::generate(), EnvId::generate(), FunctionId::generate())
    }

    fn account() -> ConstraintItem {
        ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account)
    }

    fn fixed_window(ttl_ms: u64) -> AdmissionCacheConfig {
        AdmissionCacheConfig {
            min_ttl_ms: ttl_ms,
            max_ttl_ms: ttl_ms,
            ..AdmissionCacheConfig::default()
        }
    }

    #[test]
    fn default_predicate_selects_plain_account_and_function_concurrency() {
        let p = DefaultShouldCache;
        assert!(p.should_cache(&account()));
        assert!(p.should_cache(&ConstraintItem::concurrency(ConcurrencyMode::Run, Scope::Function)));
        assert!(!p.should_cache(&ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Env)));
        assert!(!p.should_cache(&ConstraintItem::Concurrency(
            ConcurrencyConstraint::new(ConcurrencyMode::Step, Scope::Account).with_custom_key("h", "v")
        )));
        assert!(!p.should_cache(&ConstraintItem::throttle(Scope::Account, "h", "v")));
    }

    #[test]
    fn exhausted_constraints_deny_until_expiry() {
        let clock = FakeClock::shared(Utc::now());
        let cache = AdmissionCache::from_config(clock.clone(), &fixed_window(1_000));
        let (a, e, f) = ids();

        assert_eq!(cache.record_exhausted(a, e, f, &[account()]), 1);
        let hit = cache.lookup(a, e, f, &[account()]).unwrap();
        assert_eq!(hit.constraints, vec![account()]);
        assert_eq!(hit.retry_at_ms, clock.now_ms() + 1_000);

        clock.advance(chrono::Duration::milliseconds(1_000));
        assert!(cache.lookup(a, e, f, &[account()]).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn unrelated_requests_are_not_denied() {
        let clock = FakeClock::shared(Utc::now());
        let cache = AdmissionCache::from_config(clock, &fixed_window(1_000));
        let (a, e, f) = ids();
        cache.record_exhausted(a, e, f, &[account()]);

        let other = ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Function);
        assert!(cache.lookup(a, e, f, &[other]).is_none());
        assert!(cache.lookup(AccountId::generate(), e, f, &[account()]).is_none());
    }

    #[test]
    fn disabled_accounts_bypass_the_cache() {
        let clock = FakeClock::shared(Utc::now());
        let (a, e, f) = ids();
        let config = AdmissionCacheConfig {
            disabled_accounts: vec![a.to_string()],
            ..fixed_window(1_000)
        };
        let cache = AdmissionCache::from_config(clock, &config);
        assert_eq!(cache.record_exhausted(a, e, f, &[account()]), 0);
        assert!(cache.lookup(a, e, f, &[account()]).is_none());
    }

    #[test]
    fn jittered_ttls_stay_within_bounds() {
        let clock = FakeClock::shared(Utc::now());
        let config = AdmissionCacheConfig {
            min_ttl_ms: 100,
            max_ttl_ms: 200,
            ..AdmissionCacheConfig::default()
        };
        let cache = AdmissionCache::from_config(clock.clone(), &config);
        for _ in 0..50 {
            let (a, e, f) = ids();
            cache.record_exhausted(a, e, f, &[account()]);
            let hit = cache.lookup(a, e, f, &[account()]).unwrap();
            let ttl = hit.retry_at_ms - clock.now_ms();
            assert!((100..=200).contains(&ttl), "ttl {ttl} out of bounds");
        }
    }
}
