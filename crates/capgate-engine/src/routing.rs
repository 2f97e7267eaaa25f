//! Account-to-shard routing with migration gating.
//!
//! [`ShardRouter`] owns one [`StoreCapacityManager`] per shard and the
//! account placement table. [`RoutingCapacityManager`] sends each request to
//! its account's shard through the [`MigrationRegistry`], so a running
//! migration can block, pause or observe it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use capgate_core::observability::capacity_span;
use capgate_core::{AccountId, ConstraintItem, RequestId, SharedClock, scavenger_shard_index};
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::dispatch::DispatchTarget;
use crate::error::{Error, Result};
use crate::manager::{CapacityManager, Executed, StoreCapacityManager};
use crate::metrics::{CapacityMetrics, time_operation};
use crate::migration::{Gate, MigrationRegistry, OperationKind};
use crate::request::{AcquireRequest, CheckRequest, ExtendLeaseRequest, ReleaseRequest};
use crate::response::{
    AcquireDebug, AcquireResponse, CheckResponse, ExtendLeaseResponse, ReleaseResponse,
};
use crate::validation::{validate_acquire, validate_check};

/// How long callers are told to wait while their account migrates, in
/// milliseconds.
pub const MIGRATION_RETRY_AFTER_MS: i64 = 1_000;

/// Named shards and the placement of accounts on them.
///
/// Accounts without an explicit assignment are placed by hashing their ID
/// over the shard names in sorted order.
#[derive(Debug)]
pub struct ShardRouter {
    shards: BTreeMap<String, Arc<StoreCapacityManager>>,
    names: Vec<String>,
    assignments: RwLock<HashMap<AccountId, String>>,
}

impl ShardRouter {
    /// Creates a router with a single shard.
    #[must_use]
    pub fn new(name: impl Into<String>, manager: Arc<StoreCapacityManager>) -> Self {
        let name = name.into();
        Self {
            names: vec![name.clone()],
            shards: BTreeMap::from([(name, manager)]),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a shard.
    #[must_use]
    pub fn with_shard(mut self, name: impl Into<String>, manager: Arc<StoreCapacityManager>) -> Self {
        self.shards.insert(name.into(), manager);
        self.names = self.shards.keys().cloned().collect();
        self
    }

    /// Shard names in sorted order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The shard `account` currently lives on.
    #[must_use]
    pub fn shard_name(&self, account: AccountId) -> String {
        if let Some(name) = self
            .assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account)
        {
            return name.clone();
        }
        let count = u32::try_from(self.names.len()).unwrap_or(u32::MAX);
        let index = scavenger_shard_index(account, count) as usize;
        self.names[index % self.names.len()].clone()
    }

    /// The manager of a shard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardNotFound`] for an unknown name.
    pub fn manager(&self, name: &str) -> Result<Arc<StoreCapacityManager>> {
        self.shards
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound {
                shard: name.to_string(),
            })
    }

    /// The manager of the shard `account` lives on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardNotFound`] if the assignment names a removed
    /// shard.
    pub fn manager_for(&self, account: AccountId) -> Result<Arc<StoreCapacityManager>> {
        self.manager(&self.shard_name(account))
    }

    /// The default store target of a shard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardNotFound`] for an unknown name.
    pub fn target(&self, name: &str) -> Result<DispatchTarget> {
        Ok(self.manager(name)?.dispatcher().default_target().clone())
    }

    /// Places `account` on the shard named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardNotFound`] for an unknown name.
    pub fn assign(&self, account: AccountId, name: &str) -> Result<()> {
        if !self.shards.contains_key(name) {
            return Err(Error::ShardNotFound {
                shard: name.to_string(),
            });
        }
        self.assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account, name.to_string());
        tracing::info!(%account, shard = name, "account assigned to shard");
        Ok(())
    }

    /// Stops background work of every shard manager.
    pub fn shutdown(&self) {
        for manager in self.shards.values() {
            manager.shutdown();
        }
    }
}

/// [`CapacityManager`] over a [`ShardRouter`].
#[derive(Debug, Clone)]
pub struct RoutingCapacityManager {
    router: Arc<ShardRouter>,
    registry: MigrationRegistry,
    clock: SharedClock,
    metrics: CapacityMetrics,
}

impl RoutingCapacityManager {
    /// Creates a routing manager.
    #[must_use]
    pub fn new(router: Arc<ShardRouter>, registry: MigrationRegistry, clock: SharedClock) -> Self {
        Self {
            router,
            registry,
            clock,
            metrics: CapacityMetrics::new(),
        }
    }

    /// The router.
    #[must_use]
    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// The migration registry.
    #[must_use]
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    fn retry_after(&self) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::milliseconds(MIGRATION_RETRY_AFTER_MS)
    }

    async fn gated<T, F, Fut>(&self, account: AccountId, kind: OperationKind, run: F) -> Result<Option<T>>
    where
        F: FnOnce(Arc<StoreCapacityManager>) -> Fut,
        Fut: Future<Output = Result<Executed<T>>>,
    {
        let ticket = match self.registry.begin(account, kind) {
            Gate::Open(ticket) => ticket,
            Gate::Blocked(phase) => {
                tracing::debug!(%account, phase = %phase, "operation gated by migration");
                return Ok(None);
            }
        };
        let manager = self.router.manager_for(account)?;
        let executed = run(manager).await?;
        ticket.finish(&executed.written_keys);
        Ok(Some(executed.response))
    }

    /// Force-clears a concurrency lease set no constraint resolves to
    /// anymore, e.g. after a custom key expression changed. Returns the
    /// number of lease IDs removed.
    ///
    /// # Errors
    ///
    /// Returns a validation error for keys outside the account's
    /// concurrency namespace and [`Error::MigrationInProgress`] while the
    /// account is paused.
    pub async fn release_orphaned_custom_keys(
        &self,
        account: AccountId,
        lease_set_key: &str,
    ) -> Result<usize> {
        self.gated(account, OperationKind::Release, move |m| async move {
            m.release_orphaned_lease_set(account, lease_set_key).await
        })
        .await?
        .ok_or(Error::MigrationInProgress { account })
    }
}

fn sorted(constraints: &[ConstraintItem]) -> Vec<ConstraintItem> {
    let mut constraints = constraints.to_vec();
    constraints.sort();
    constraints
}

fn outcome<T>(operation: &'static str, metrics: &CapacityMetrics, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        metrics.record_operation(operation, "error");
        if err.is_user_error() {
            tracing::debug!(operation, error = %err, "request rejected");
        } else {
            tracing::warn!(operation, error = %err, "capacity operation failed");
        }
    }
    result
}

#[async_trait]
impl CapacityManager for RoutingCapacityManager {
    async fn check(&self, req: CheckRequest) -> Result<CheckResponse> {
        let _timer = time_operation("check");
        let account = req.account_id;
        let request = &req;
        let run = async {
            let checked = self
                .gated(account, OperationKind::Check, move |m| async move {
                    m.check_inner(request).await
                })
                .await?;
            if let Some(response) = checked {
                return Ok(response);
            }
            validate_check(request)?;
            self.metrics.record_operation("check", "migrating");
            Ok(CheckResponse {
                available_capacity: 0,
                limiting_constraints: sorted(&request.constraints),
                usage: Vec::new(),
                fairness_reduction: 0,
                retry_after: Some(self.retry_after()),
                idempotent_replay: false,
            })
        };
        let span = capacity_span("check", &account.to_string());
        outcome("check", &self.metrics, run.instrument(span).await)
    }

    async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResponse> {
        let _timer = time_operation("acquire");
        let account = req.account_id;
        let request = &req;
        let run = async {
            let acquired = self
                .gated(account, OperationKind::Acquire, move |m| async move {
                    m.acquire_inner(request).await
                })
                .await?;
            if let Some(response) = acquired {
                return Ok(response);
            }
            validate_acquire(request)?;
            self.metrics.record_operation("acquire", "migrating");
            Ok(AcquireResponse {
                request_id: RequestId::at(self.clock.now()),
                leases: Vec::new(),
                limiting_constraints: sorted(&request.constraints),
                exhausted_constraints: Vec::new(),
                fairness_reduction: 0,
                retry_after: Some(self.retry_after()),
                debug: AcquireDebug::default(),
            })
        };
        let span = capacity_span("acquire", &account.to_string());
        outcome("acquire", &self.metrics, run.instrument(span).await)
    }

    async fn extend_lease(&self, req: ExtendLeaseRequest) -> Result<ExtendLeaseResponse> {
        let _timer = time_operation("extend");
        let account = req.account_id;
        let request = &req;
        let run = async {
            self.gated(account, OperationKind::Extend, move |m| async move {
                m.extend_inner(request).await
            })
            .await?
            .ok_or(Error::MigrationInProgress { account })
        };
        let span = capacity_span("extend", &account.to_string());
        outcome("extend", &self.metrics, run.instrument(span).await)
    }

    async fn release(&self, req: ReleaseRequest) -> Result<ReleaseResponse> {
        let _timer = time_operation("release");
        let account = req.account_id;
        let request = &req;
        let run = async {
            self.gated(account, OperationKind::Release, move |m| async move {
                m.release_inner(request).await
            })
            .await?
            .ok_or(Error::MigrationInProgress { account })
        };
        let span = capacity_span("release", &account.to_string());
        outcome("release", &self.metrics, run.instrument(span).await)
    }
}
