//! Reclamation of expired leases.
//!
//! ```text
//! ScavengerService (interval)
//!     │
//!     ├── per store, per scavenger shard (one worker each)
//!     │       │
//!     │       ├── peek: accounts whose earliest lease expired
//!     │       │
//!     │       └── per account: reclaim expired leases, notify hook
//!     │
//!     └── errors are logged; the next tick retries
//! ```
//!
//! Accounts that are being migrated are skipped until the migration ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use capgate_core::{AccountId, ScavengerConfig};
use futures::future::join_all;

use crate::dispatch::{DispatchTarget, Dispatcher};
use crate::error::Result;
use crate::lifecycle::{LeaseLifecycleHook, ReclaimedLease};
use crate::manager::encode;
use crate::metrics::CapacityMetrics;
use crate::migration::{Gate, MigrationRegistry, OperationKind};
use crate::scripts::wire::{PeekArgs, PeekReply, ReclaimArgs, ReclaimReply};
use crate::scripts::{PEEK_SCAVENGER, RECLAIM};

/// Outcome of one pass over a scavenger shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScavengeResult {
    /// Expired leases found in the scanned accounts.
    pub total_expired_leases: usize,
    /// Accounts in the shard with expired leases.
    pub total_expired_accounts: usize,
    /// Accounts in the shard.
    pub total_accounts: usize,
    /// Leases removed.
    pub reclaimed_leases: usize,
    /// Accounts reclaimed from.
    pub scanned_accounts: usize,
}

impl ScavengeResult {
    fn merge(&mut self, other: &Self) {
        self.total_expired_leases += other.total_expired_leases;
        self.total_expired_accounts += other.total_expired_accounts;
        self.total_accounts += other.total_accounts;
        self.reclaimed_leases += other.reclaimed_leases;
        self.scanned_accounts += other.scanned_accounts;
    }
}

/// Reclaims expired leases on one store.
#[derive(Clone)]
pub struct Scavenger {
    dispatcher: Dispatcher,
    config: ScavengerConfig,
    num_shards: u32,
    hook: Option<Arc<dyn LeaseLifecycleHook>>,
    registry: Option<MigrationRegistry>,
    metrics: CapacityMetrics,
}

impl std::fmt::Debug for Scavenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scavenger")
            .field("target", self.dispatcher.default_target())
            .field("num_shards", &self.num_shards)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl Scavenger {
    /// Creates a scavenger for the dispatcher's default target.
    #[must_use]
    pub fn new(dispatcher: Dispatcher, config: ScavengerConfig, num_shards: u32) -> Self {
        Self {
            dispatcher,
            config,
            num_shards: num_shards.max(1),
            hook: None,
            registry: None,
            metrics: CapacityMetrics::new(),
        }
    }

    /// Delivers reclaimed leases to `hook`.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn LeaseLifecycleHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Skips accounts with a running migration.
    #[must_use]
    pub fn with_registry(mut self, registry: MigrationRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Number of scavenger shards.
    #[must_use]
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    fn target(&self) -> &DispatchTarget {
        self.dispatcher.default_target()
    }

    /// Runs one pass over scavenger shard `shard`.
    ///
    /// # Errors
    ///
    /// Returns the store error of the peek. Failures of individual accounts
    /// are logged and skipped.
    pub async fn scavenge(&self, shard: u32) -> Result<ScavengeResult> {
        let started = Instant::now();
        let target = self.target();
        let shard_key = target.prefix.scavenger_shard(shard);
        let peek: PeekReply = self
            .dispatcher
            .eval(
                target,
                &PEEK_SCAVENGER,
                &[shard_key.clone()],
                &[encode(&PeekArgs {
                    max: self.config.accounts_peek,
                })?],
            )
            .await?;

        let mut result = ScavengeResult {
            total_expired_accounts: peek.te,
            total_accounts: peek.t,
            ..ScavengeResult::default()
        };

        for peeked in peek.a.iter() {
            let Ok(account) = peeked.a.parse::<AccountId>() else {
                tracing::warn!(shard, member = %peeked.a, "unparseable scavenger member");
                continue;
            };
            match self.reclaim_account(account, &shard_key).await {
                Ok(Some(reply)) => {
                    result.scanned_accounts += 1;
                    result.total_expired_leases += reply.te;
                    result.reclaimed_leases += reply.l.len();
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(shard, %account, error = %err, "reclaim failed");
                }
            }
        }

        self.metrics.record_reclaimed(shard, result.reclaimed_leases);
        self.metrics.observe_scavenger_pass(shard, started.elapsed());
        if result.reclaimed_leases > 0 {
            tracing::info!(
                store = target.store.name(),
                shard,
                reclaimed = result.reclaimed_leases,
                accounts = result.scanned_accounts,
                "reclaimed expired leases"
            );
        }
        Ok(result)
    }

    async fn reclaim_account(
        &self,
        account: AccountId,
        shard_key: &str,
    ) -> Result<Option<ReclaimReply>> {
        let ticket = match &self.registry {
            Some(registry) => match registry.begin(account, OperationKind::Reclaim) {
                Gate::Open(ticket) => Some(ticket),
                Gate::Blocked(phase) => {
                    tracing::debug!(%account, phase = %phase, "skipping migrating account");
                    return Ok(None);
                }
            },
            None => None,
        };

        let target = self.target();
        let keys = target.prefix.account(account);
        let reply: ReclaimReply = self
            .dispatcher
            .eval(
                target,
                &RECLAIM,
                &[keys.lease_index(), shard_key.to_string()],
                &[encode(&ReclaimArgs {
                    a: account,
                    lp: keys.lease_prefix(),
                    rsp: keys.request_state_prefix(),
                    max: self.config.leases_peek,
                })?],
            )
            .await?;
        if let Some(ticket) = ticket {
            ticket.finish(&reply.w);
        }

        if let Some(hook) = &self.hook {
            for lease in reply.l.iter() {
                hook.on_reclaimed(&ReclaimedLease {
                    account_id: account,
                    lease_id: lease.id,
                    lease_idempotency_key: lease.k.clone(),
                    run_id: lease.run,
                    env_id: lease.e,
                    function_id: lease.f,
                    source: lease.src,
                })
                .await;
            }
        }
        Ok(Some(reply))
    }

    /// Runs one pass over every scavenger shard, one worker per shard.
    pub async fn scavenge_all(&self) -> ScavengeResult {
        let passes = (0..self.num_shards)
            .map(|shard| async move { (shard, self.scavenge(shard).await) });
        let mut total = ScavengeResult::default();
        for (shard, outcome) in join_all(passes).await {
            match outcome {
                Ok(result) => total.merge(&result),
                Err(err) => {
                    tracing::warn!(
                        store = self.target().store.name(),
                        shard,
                        error = %err,
                        "scavenger pass failed"
                    );
                }
            }
        }
        total
    }
}

/// Periodic scavenging of every store.
#[derive(Debug, Clone)]
pub struct ScavengerService {
    scavengers: Vec<Scavenger>,
    interval: Duration,
}

impl ScavengerService {
    /// Creates a service ticking every `interval`.
    #[must_use]
    pub fn new(scavengers: Vec<Scavenger>, interval: Duration) -> Self {
        Self {
            scavengers,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Creates a service ticking at the configured interval.
    #[must_use]
    pub fn from_config(scavengers: Vec<Scavenger>, config: &ScavengerConfig) -> Self {
        Self::new(scavengers, Duration::from_millis(config.interval_ms))
    }

    /// Runs one pass over every store.
    pub async fn run_once(&self) -> ScavengeResult {
        let mut total = ScavengeResult::default();
        for result in join_all(self.scavengers.iter().map(Scavenger::scavenge_all)).await {
            total.merge(&result);
        }
        total
    }

    /// Runs passes until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(
            stores = self.scavengers.len(),
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "scavenger started"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    let result = self.run_once().await;
                    tracing::debug!(
                        reclaimed = result.reclaimed_leases,
                        accounts = result.scanned_accounts,
                        "scavenger tick"
                    );
                }
            }
        }
        tracing::info!("scavenger stopped");
    }
}
