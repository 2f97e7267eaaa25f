//! Pre-built test environment and request factories.
//!
//! [`TestEnv`] wires a fake clock, in-memory shards, one capacity manager
//! per shard, a router and a routing manager around a single account.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use capgate_core::constraint::{ConcurrencyConstraint, ConcurrencyMode};
use capgate_core::constraint_config::{CustomConcurrencyLimit, RateLimitConfig, ThrottleConfig};
use capgate_core::{
    AccountId, AccountKeys, CapacityConfig, ConstraintConfig, ConstraintItem, EnvId, FakeClock,
    FunctionId, KeyPrefix, LeaseId, LeaseSource, RunId, Scope, SharedClock, scavenger_shard_index,
};
use capgate_engine::dispatch::{DispatchTarget, Dispatcher};
use capgate_engine::migration::{KeyCopier, MigrationCoordinator, MigrationRegistry};
use capgate_engine::{
    AcquireRequest, CheckRequest, ExtendLeaseRequest, MigrationIdentifier, ReleaseRequest,
    RoutingCapacityManager, Scavenger, ShardRouter, StoreCapacityManager,
};
use capgate_store::MemoryStore;
use chrono::{DateTime, TimeZone, Utc};

/// Wall-clock start of every test environment.
#[must_use]
pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Name of shard `index`.
#[must_use]
pub fn shard_name(index: usize) -> String {
    format!("shard-{index}")
}

/// Builds a [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    shards: usize,
    config: CapacityConfig,
    configuration: ConstraintConfig,
    constraints: Vec<ConstraintItem>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        let mut config = CapacityConfig {
            key_prefix: "test".to_string(),
            num_scavenger_shards: 4,
            ..CapacityConfig::default()
        };
        config.admission_cache.min_ttl_ms = 1_000;
        config.admission_cache.max_ttl_ms = 1_000;
        Self {
            shards: 1,
            config,
            configuration: ConstraintConfig {
                function_version: 1,
                ..ConstraintConfig::default()
            },
            constraints: Vec::new(),
        }
    }
}

impl TestEnvBuilder {
    /// Number of shards.
    #[must_use]
    pub fn shards(mut self, count: usize) -> Self {
        self.shards = count.max(1);
        self
    }

    /// Edits the service configuration.
    #[must_use]
    pub fn config(mut self, edit: impl FnOnce(&mut CapacityConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Switches the admission cache on or off.
    #[must_use]
    pub fn admission_cache(self, enabled: bool) -> Self {
        self.config(|c| c.admission_cache.enabled = enabled)
    }

    /// Adds an account-scope step concurrency ceiling.
    #[must_use]
    pub fn account_concurrency(mut self, limit: u32) -> Self {
        self.configuration.concurrency.account_concurrency = limit;
        self.constraints
            .push(ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account));
        self
    }

    /// Adds a function-scope step concurrency ceiling.
    #[must_use]
    pub fn function_concurrency(mut self, limit: u32) -> Self {
        self.configuration.concurrency.function_concurrency = limit;
        self.constraints
            .push(ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Function));
        self
    }

    /// Adds a custom-key concurrency ceiling.
    #[must_use]
    pub fn custom_concurrency(
        mut self,
        scope: Scope,
        key_expression_hash: &str,
        evaluated_key_hash: &str,
        limit: u32,
    ) -> Self {
        self.configuration
            .concurrency
            .custom_concurrency_keys
            .push(CustomConcurrencyLimit {
                mode: ConcurrencyMode::Step,
                scope,
                limit,
                key_expression_hash: key_expression_hash.to_string(),
            });
        self.constraints.push(ConstraintItem::Concurrency(
            ConcurrencyConstraint::new(ConcurrencyMode::Step, scope)
                .with_custom_key(key_expression_hash, evaluated_key_hash),
        ));
        self
    }

    /// Adds a function-scope throttle.
    #[must_use]
    pub fn throttle(mut self, limit: u32, burst: u32, period_secs: u32) -> Self {
        self.configuration.throttles.push(ThrottleConfig {
            scope: Scope::Function,
            limit,
            burst,
            period_secs,
            key_expression_hash: "throttle".to_string(),
        });
        self.constraints
            .push(ConstraintItem::throttle(Scope::Function, "throttle", "fn"));
        self
    }

    /// Adds a function-scope rate limit; the burst is a tenth of `limit`.
    #[must_use]
    pub fn rate_limit(mut self, limit: u32, period_secs: u32) -> Self {
        self.configuration.rate_limits.push(RateLimitConfig {
            scope: Scope::Function,
            limit,
            period_secs,
            key_expression_hash: "rate".to_string(),
        });
        self.constraints
            .push(ConstraintItem::rate_limit(Scope::Function, "rate", "fn"));
        self
    }

    /// Builds the environment.
    #[must_use]
    pub fn build(self) -> TestEnv {
        let clock = FakeClock::shared(test_start());
        let shared: SharedClock = clock.clone();
        let config = Arc::new(self.config);
        let prefix = KeyPrefix::new(config.key_prefix.clone());

        let stores: Vec<Arc<MemoryStore>> = (0..self.shards)
            .map(|i| Arc::new(MemoryStore::new(shard_name(i), Arc::clone(&shared))))
            .collect();
        let managers: Vec<Arc<StoreCapacityManager>> = stores
            .iter()
            .map(|store| {
                let target = DispatchTarget::new(store.clone(), prefix.clone());
                Arc::new(StoreCapacityManager::new(
                    Arc::clone(&config),
                    Arc::clone(&shared),
                    Dispatcher::new(target),
                ))
            })
            .collect();

        let mut router = ShardRouter::new(shard_name(0), Arc::clone(&managers[0]));
        for (i, manager) in managers.iter().enumerate().skip(1) {
            router = router.with_shard(shard_name(i), Arc::clone(manager));
        }
        let router = Arc::new(router);
        let account = AccountId::generate();
        router
            .assign(account, &shard_name(0))
            .expect("shard-0 exists");

        let registry = MigrationRegistry::new();
        let routing = RoutingCapacityManager::new(Arc::clone(&router), registry.clone(), shared);

        TestEnv {
            clock,
            config,
            prefix,
            stores,
            managers,
            router,
            registry,
            routing,
            account,
            env: EnvId::generate(),
            function: FunctionId::generate(),
            configuration: self.configuration,
            constraints: self.constraints,
        }
    }
}

/// A complete single-account test environment.
pub struct TestEnv {
    /// Shared fake clock.
    pub clock: Arc<FakeClock>,
    /// Service configuration.
    pub config: Arc<CapacityConfig>,
    /// Key prefix on every shard.
    pub prefix: KeyPrefix,
    /// Shards, `shard-0` first.
    pub stores: Vec<Arc<MemoryStore>>,
    /// One manager per shard.
    pub managers: Vec<Arc<StoreCapacityManager>>,
    /// Account placement.
    pub router: Arc<ShardRouter>,
    /// Migration state.
    pub registry: MigrationRegistry,
    /// Routing manager over every shard.
    pub routing: RoutingCapacityManager,
    /// The account under test, placed on `shard-0`.
    pub account: AccountId,
    /// Environment of the function under test.
    pub env: EnvId,
    /// Function under test.
    pub function: FunctionId,
    /// Declared ceilings.
    pub configuration: ConstraintConfig,
    /// Constraints every request carries.
    pub constraints: Vec<ConstraintItem>,
}

impl TestEnv {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    /// Manager of `shard-0`.
    #[must_use]
    pub fn manager(&self) -> &Arc<StoreCapacityManager> {
        &self.managers[0]
    }

    /// Store of `shard-0`.
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.stores[0]
    }

    /// Keys of the account under test.
    #[must_use]
    pub fn keys(&self) -> AccountKeys {
        self.prefix.account(self.account)
    }

    /// Scavenger shard holding the account.
    #[must_use]
    pub fn scavenger_shard(&self) -> u32 {
        scavenger_shard_index(self.account, self.config.num_scavenger_shards)
    }

    /// Key of the scavenger shard holding the account.
    #[must_use]
    pub fn scavenger_key(&self) -> String {
        self.prefix.scavenger_shard(self.scavenger_shard())
    }

    /// Scavenger for shard `index`, gated by the migration registry.
    #[must_use]
    pub fn scavenger(&self, index: usize) -> Scavenger {
        Scavenger::new(
            self.managers[index].dispatcher().clone(),
            self.config.scavenger.clone(),
            self.config.num_scavenger_shards,
        )
        .with_registry(self.registry.clone())
    }

    /// Migration coordinator sharing the routing manager's registry.
    #[must_use]
    pub fn coordinator(&self, copier: Arc<dyn KeyCopier>) -> MigrationCoordinator {
        MigrationCoordinator::new(
            self.config.migration.clone(),
            self.registry.clone(),
            copier,
            self.config.num_scavenger_shards,
        )
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).expect("duration in range"));
    }

    /// Acquire of one lease per key, 5s leases living at most 60s.
    #[must_use]
    pub fn acquire(&self, idempotency_key: &str, lease_keys: &[&str]) -> AcquireRequest {
        AcquireRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: self.account,
            env_id: self.env,
            function_id: self.function,
            configuration: self.configuration.clone(),
            constraints: self.constraints.clone(),
            amount: u32::try_from(lease_keys.len()).expect("small amount"),
            lease_idempotency_keys: lease_keys.iter().map(ToString::to_string).collect(),
            lease_run_ids: BTreeMap::new(),
            current_time: self.clock_now(),
            duration: Duration::from_secs(5),
            maximum_lifetime: Duration::from_secs(60),
            blocking_threshold: None,
            source: LeaseSource::default(),
            migration: MigrationIdentifier::default(),
            request_attempt: 0,
        }
    }

    /// Same as [`acquire`](Self::acquire) with a run per lease key.
    #[must_use]
    pub fn acquire_for_runs(&self, idempotency_key: &str, lease_keys: &[&str]) -> AcquireRequest {
        let mut req = self.acquire(idempotency_key, lease_keys);
        req.lease_run_ids = lease_keys
            .iter()
            .map(|k| ((*k).to_string(), RunId::generate()))
            .collect();
        req
    }

    /// Check of the configured constraints.
    #[must_use]
    pub fn check(&self) -> CheckRequest {
        CheckRequest {
            account_id: self.account,
            env_id: self.env,
            function_id: self.function,
            configuration: self.configuration.clone(),
            constraints: self.constraints.clone(),
            current_time: self.clock_now(),
            migration: MigrationIdentifier::default(),
        }
    }

    /// Extension of `lease_id` by `duration`.
    #[must_use]
    pub fn extend(&self, lease_id: LeaseId, idempotency_key: &str, duration: Duration) -> ExtendLeaseRequest {
        ExtendLeaseRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: self.account,
            lease_id,
            duration,
            migration: MigrationIdentifier::default(),
            source: LeaseSource::default(),
            request_attempt: 0,
        }
    }

    /// Release of `lease_id`.
    #[must_use]
    pub fn release(&self, lease_id: LeaseId, idempotency_key: &str) -> ReleaseRequest {
        ReleaseRequest {
            idempotency_key: idempotency_key.to_string(),
            account_id: self.account,
            lease_id,
            migration: MigrationIdentifier::default(),
            source: LeaseSource::default(),
            request_attempt: 0,
        }
    }

    fn clock_now(&self) -> DateTime<Utc> {
        use capgate_core::Clock;
        self.clock.now()
    }
}
