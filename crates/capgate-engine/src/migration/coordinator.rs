//! Moves one account's constraint state between shards.
//!
//! ```text
//! CopyingGcra        acquires blocked; throttle/rate-limit state is frozen
//!     │
//! CopyingLeaseState  leases, lease sets, request state, idempotency records,
//!     │              scavenger member; extend/release keep running and
//!     │              their writes are tracked as dirty
//! ConvergingDelta    re-copy dirty keys until few remain
//!     │
//! FinalSync          everything paused; last dirty keys copied
//!     │
//! SwitchingRoute     routing table points at the destination; unpause
//!     │
//! Cleanup            source keys unlinked in the background
//! ```
//!
//! Any failure before the switch unpauses the account and leaves it on its
//! source shard; whatever reached the destination is unlinked.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use capgate_core::{AccountId, AccountKeys, MigrationConfig, scavenger_shard_index};
use capgate_core::observability::migration_span;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::copier::{CopyOutcome, KeyCopier};
use super::dirty::DirtyKeyTracker;
use super::phase::MigrationPhase;
use super::registry::MigrationRegistry;
use crate::dispatch::DispatchTarget;
use crate::error::{Error, Result};
use crate::metrics::CapacityMetrics;
use crate::routing::ShardRouter;

/// Counts and timings of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// Migrated account.
    pub account_id: AccountId,
    /// Source shard name.
    pub source: String,
    /// Destination shard name.
    pub destination: String,
    /// [`MigrationPhase::Complete`] or [`MigrationPhase::Failed`].
    pub phase: MigrationPhase,
    /// Throttle and rate-limit keys copied.
    pub gcra_keys_copied: usize,
    /// Lease-state keys copied, including the scavenger member.
    pub lease_state_keys_copied: usize,
    /// Dirty keys re-copied during convergence.
    pub delta_keys_copied: usize,
    /// Convergence passes run.
    pub delta_passes: usize,
    /// Keys copied while paused.
    pub final_sync_keys: usize,
    /// Wall time of the whole migration.
    pub total_duration: Duration,
    /// Time extend and release were paused.
    pub full_pause_duration: Duration,
    /// Phase that failed, if any.
    pub failed_phase: Option<MigrationPhase>,
    /// Failure description, if any.
    pub error: Option<String>,
}

impl MigrationResult {
    fn new(account_id: AccountId, source: &str, destination: &str) -> Self {
        Self {
            account_id,
            source: source.to_string(),
            destination: destination.to_string(),
            phase: MigrationPhase::Idle,
            gcra_keys_copied: 0,
            lease_state_keys_copied: 0,
            delta_keys_copied: 0,
            delta_passes: 0,
            final_sync_keys: 0,
            total_duration: Duration::ZERO,
            full_pause_duration: Duration::ZERO,
            failed_phase: None,
            error: None,
        }
    }

    /// Returns true when the destination is authoritative.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == MigrationPhase::Complete
    }

    /// Converts a failed migration into [`Error::MigrationFailed`].
    ///
    /// # Errors
    ///
    /// Returns the failure when the migration did not complete.
    pub fn into_result(self) -> Result<Self> {
        match (&self.error, self.failed_phase) {
            (Some(message), phase) => Err(Error::MigrationFailed {
                account: self.account_id,
                phase: phase.unwrap_or(MigrationPhase::Failed).to_string(),
                message: message.clone(),
            }),
            (None, _) => Ok(self),
        }
    }
}

/// Both ends of a migration, resolved once.
struct Endpoints {
    source: DispatchTarget,
    destination: DispatchTarget,
    source_keys: AccountKeys,
    destination_keys: AccountKeys,
}

impl Endpoints {
    fn rebase(&self, key: &str) -> String {
        key.strip_prefix(self.source_keys.hash_tag())
            .map_or_else(|| key.to_string(), |rest| format!("{}{rest}", self.destination_keys.hash_tag()))
    }
}

/// Runs shard migrations.
#[derive(Debug)]
pub struct MigrationCoordinator {
    config: MigrationConfig,
    registry: MigrationRegistry,
    copier: Arc<dyn KeyCopier>,
    num_scavenger_shards: u32,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
    metrics: CapacityMetrics,
}

impl MigrationCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        config: MigrationConfig,
        registry: MigrationRegistry,
        copier: Arc<dyn KeyCopier>,
        num_scavenger_shards: u32,
    ) -> Self {
        Self {
            config,
            registry,
            copier,
            num_scavenger_shards,
            cleanups: Mutex::new(Vec::new()),
            metrics: CapacityMetrics::new(),
        }
    }

    /// The registry operations consult.
    #[must_use]
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Moves `account` to the shard named `destination`.
    ///
    /// Failures are reported in the result; use
    /// [`MigrationResult::into_result`] to turn them into errors.
    pub async fn migrate(
        &self,
        router: &ShardRouter,
        account: AccountId,
        destination: &str,
    ) -> MigrationResult {
        let source = router.shard_name(account);
        let span = migration_span(&account.to_string(), &source, destination);
        self.run(router, account, source.clone(), destination)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        router: &ShardRouter,
        account: AccountId,
        source: String,
        destination: &str,
    ) -> MigrationResult {
        let started = Instant::now();
        let mut result = MigrationResult::new(account, &source, destination);

        let endpoints = match self.endpoints(router, account, &source, destination) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                fail(&mut result, MigrationPhase::Idle, &err);
                result.total_duration = started.elapsed();
                return result;
            }
        };
        let dirty = match self.registry.start(account) {
            Ok(dirty) => dirty,
            Err(err) => {
                fail(&mut result, MigrationPhase::Idle, &err);
                result.total_duration = started.elapsed();
                return result;
            }
        };
        tracing::info!("migration started");

        let outcome = self
            .copy_and_switch(router, account, &endpoints, &dirty, &mut result)
            .await;
        self.registry.end(account);

        match outcome {
            Ok(()) => {
                result.phase = MigrationPhase::Complete;
                self.spawn_cleanup(
                    endpoints.source.clone(),
                    endpoints.source_keys.clone(),
                    self.scavenger_key(&endpoints.source, account),
                );
                tracing::info!(
                    gcra_keys = result.gcra_keys_copied,
                    lease_state_keys = result.lease_state_keys_copied,
                    delta_keys = result.delta_keys_copied,
                    delta_passes = result.delta_passes,
                    final_sync_keys = result.final_sync_keys,
                    pause_ms = u64::try_from(result.full_pause_duration.as_millis()).unwrap_or(u64::MAX),
                    "migration complete"
                );
            }
            Err((phase, err)) => {
                fail(&mut result, phase, &err);
                self.spawn_cleanup(
                    endpoints.destination.clone(),
                    endpoints.destination_keys.clone(),
                    self.scavenger_key(&endpoints.destination, account),
                );
            }
        }
        result.total_duration = started.elapsed();
        result
    }

    fn endpoints(
        &self,
        router: &ShardRouter,
        account: AccountId,
        source: &str,
        destination: &str,
    ) -> Result<Endpoints> {
        if source == destination {
            return Err(Error::validation(
                "destination",
                format!("account already lives on {destination}"),
            ));
        }
        let source = router.target(source)?;
        let destination = router.target(destination)?;
        Ok(Endpoints {
            source_keys: source.prefix.account(account),
            destination_keys: destination.prefix.account(account),
            source,
            destination,
        })
    }

    async fn copy_and_switch(
        &self,
        router: &ShardRouter,
        account: AccountId,
        endpoints: &Endpoints,
        dirty: &DirtyKeyTracker,
        result: &mut MigrationResult,
    ) -> std::result::Result<(), (MigrationPhase, Error)> {
        let phase = MigrationPhase::CopyingGcra;
        let timer = Instant::now();
        let gcra = self
            .scan_keys(endpoints, &endpoints.source_keys.gcra_patterns())
            .await
            .map_err(|e| (phase, e))?;
        result.gcra_keys_copied = self.copy_keys(endpoints, &gcra).await.map_err(|e| (phase, e))?;
        self.phase_done(phase, timer);

        let phase = MigrationPhase::CopyingLeaseState;
        self.registry.set_phase(account, phase);
        let timer = Instant::now();
        let lease_state: Vec<String> = self
            .scan_keys(endpoints, &[endpoints.source_keys.all_pattern()])
            .await
            .map_err(|e| (phase, e))?
            .into_iter()
            .filter(|k| !endpoints.source_keys.is_gcra_key(k))
            .collect();
        result.lease_state_keys_copied = self
            .copy_keys(endpoints, &lease_state)
            .await
            .map_err(|e| (phase, e))?;
        if self
            .copy_scavenger_member(account, endpoints)
            .await
            .map_err(|e| (phase, e))?
        {
            result.lease_state_keys_copied += 1;
        }
        self.phase_done(phase, timer);

        let phase = MigrationPhase::ConvergingDelta;
        self.registry.set_phase(account, phase);
        let timer = Instant::now();
        while dirty.len() > self.config.delta_convergence_threshold
            && result.delta_passes < self.config.max_delta_passes
        {
            let keys = dirty.drain();
            result.delta_keys_copied += self.copy_keys(endpoints, &keys).await.map_err(|e| (phase, e))?;
            result.delta_passes += 1;
            tracing::debug!(pass = result.delta_passes, keys = keys.len(), "delta pass copied");
        }
        self.phase_done(phase, timer);

        let phase = MigrationPhase::FinalSync;
        let paused = Instant::now();
        self.registry.pause(account).await;
        let synced = async {
            let keys = dirty.drain();
            let copied = self.copy_keys(endpoints, &keys).await?;
            self.copy_scavenger_member(account, endpoints).await?;
            Ok::<_, Error>(copied)
        }
        .await;
        let switched = match synced {
            Ok(copied) => {
                result.final_sync_keys = copied;
                self.registry.set_phase(account, MigrationPhase::SwitchingRoute);
                router
                    .assign(account, &result.destination)
                    .map_err(|e| (MigrationPhase::SwitchingRoute, e))
            }
            Err(err) => Err((phase, err)),
        };
        result.full_pause_duration = paused.elapsed();
        self.metrics.observe_migration_pause(result.full_pause_duration);
        self.phase_done(phase, paused);
        switched
    }

    async fn scan_keys(&self, endpoints: &Endpoints, patterns: &[String]) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for pattern in patterns {
            let mut cursor = 0;
            loop {
                let (next, batch) = endpoints
                    .source
                    .store
                    .scan(cursor, pattern, self.config.scan_count)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn copy_keys(&self, endpoints: &Endpoints, keys: &[String]) -> Result<usize> {
        let mut copied = 0;
        for batch in keys.chunks(self.config.copy_batch_size.max(1)) {
            for key in batch {
                let outcome = self
                    .copier
                    .copy(
                        endpoints.source.store.as_ref(),
                        key,
                        endpoints.destination.store.as_ref(),
                        &endpoints.rebase(key),
                    )
                    .await?;
                if outcome == CopyOutcome::Copied {
                    copied += 1;
                }
            }
            tracing::trace!(keys = batch.len(), "copied key batch");
        }
        Ok(copied)
    }

    /// Mirrors the account's scavenger entry; returns true when it exists.
    async fn copy_scavenger_member(&self, account: AccountId, endpoints: &Endpoints) -> Result<bool> {
        let member = account.to_string();
        let source_key = self.scavenger_key(&endpoints.source, account);
        let destination_key = self.scavenger_key(&endpoints.destination, account);
        match endpoints.source.store.zscore(&source_key, &member).await? {
            Some(score) => {
                endpoints.destination.store.zadd(&destination_key, &member, score).await?;
                Ok(true)
            }
            None => {
                endpoints.destination.store.zrem(&destination_key, &member).await?;
                Ok(false)
            }
        }
    }

    fn scavenger_key(&self, target: &DispatchTarget, account: AccountId) -> String {
        target
            .prefix
            .scavenger_shard(scavenger_shard_index(account, self.num_scavenger_shards))
    }

    fn phase_done(&self, phase: MigrationPhase, started: Instant) {
        let elapsed = started.elapsed();
        self.metrics.observe_migration_phase(phase.as_str(), elapsed);
        tracing::debug!(phase = %phase, elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX), "migration phase done");
    }

    fn spawn_cleanup(&self, target: DispatchTarget, keys: AccountKeys, scavenger_key: String) {
        let batch_size = self.config.copy_batch_size.max(1);
        let scan_count = self.config.scan_count;
        let task = tokio::spawn(
            async move {
                let started = Instant::now();
                match unlink_account(&target, &keys, &scavenger_key, scan_count, batch_size).await {
                    Ok(removed) => tracing::debug!(store = target.store.name(), removed, "migration cleanup done"),
                    Err(err) => tracing::warn!(store = target.store.name(), error = %err, "migration cleanup failed"),
                }
                CapacityMetrics::new().observe_migration_phase(MigrationPhase::Cleanup.as_str(), started.elapsed());
            }
            .in_current_span(),
        );
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Waits for every background cleanup started so far.
    pub async fn wait_for_cleanup(&self) {
        let tasks = std::mem::take(&mut *self.cleanups.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "migration cleanup task aborted");
            }
        }
    }
}

fn fail(result: &mut MigrationResult, phase: MigrationPhase, err: &Error) {
    tracing::error!(phase = %phase, error = %err, "migration failed");
    result.phase = MigrationPhase::Failed;
    result.failed_phase = Some(phase);
    result.error = Some(err.to_string());
}

async fn unlink_account(
    target: &DispatchTarget,
    keys: &AccountKeys,
    scavenger_key: &str,
    scan_count: usize,
    batch_size: usize,
) -> Result<usize> {
    let pattern = keys.all_pattern();
    let mut found = Vec::new();
    let mut cursor = 0;
    loop {
        let (next, batch) = target.store.scan(cursor, &pattern, scan_count).await?;
        found.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    let mut removed = 0;
    for batch in found.chunks(batch_size) {
        removed += target.store.unlink(batch).await?;
    }
    target
        .store
        .zrem(scavenger_key, &keys.account_id().to_string())
        .await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_results_become_errors() {
        let account = AccountId::generate();
        let mut result = MigrationResult::new(account, "shard-0", "shard-1");
        fail(&mut result, MigrationPhase::FinalSync, &Error::internal("boom"));

        assert!(!result.is_complete());
        match result.into_result() {
            Err(Error::MigrationFailed { phase, message, .. }) => {
                assert_eq!(phase, "final_sync");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
