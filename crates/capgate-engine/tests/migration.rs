//! Moving an account between shards while traffic keeps flowing.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capgate_core::Scope;
use capgate_engine::migration::{CopyOutcome, MigrationPhase};
use capgate_engine::prelude::*;
use capgate_store::KeyValueStore;
use capgate_test_utils::{TestEnv, account_keys, assert_lease_invariants, init_test_logging, shard_name};
use tokio::sync::oneshot;

/// Pauses chosen copy calls until the test lets them continue.
#[derive(Debug, Default)]
struct HoldingCopier {
    inner: DumpRestoreCopier,
    calls: AtomicUsize,
    holds: Mutex<BTreeMap<usize, (oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl HoldingCopier {
    /// Holds the `call`-th copy (0-based). Resolves the first receiver when
    /// the call is reached; the call continues once the sender fires.
    fn hold_at(&self, call: usize) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        self.holds.lock().unwrap().insert(call, (reached_tx, resume_rx));
        (reached_rx, resume_tx)
    }
}

#[async_trait]
impl KeyCopier for HoldingCopier {
    async fn copy(
        &self,
        source: &dyn KeyValueStore,
        source_key: &str,
        destination: &dyn KeyValueStore,
        destination_key: &str,
    ) -> Result<CopyOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.holds.lock().unwrap().remove(&call);
        if let Some((reached, resume)) = hold {
            let _ = reached.send(());
            let _ = resume.await;
        }
        self.inner
            .copy(source, source_key, destination, destination_key)
            .await
    }
}

fn two_shards() -> TestEnv {
    TestEnv::builder()
        .shards(2)
        .admission_cache(false)
        .account_concurrency(5)
        .throttle(100, 10, 60)
        .build()
}

async fn migrates_with(copier: Arc<dyn KeyCopier>) -> Result<()> {
    init_test_logging();
    let env = two_shards();
    let granted = env.routing.acquire(env.acquire("a", &["l1", "l2"])).await?;
    assert_eq!(granted.leases.len(), 2);
    let before = env.routing.check(env.check()).await?;

    let coordinator = env.coordinator(copier);
    let result = coordinator
        .migrate(&env.router, env.account, &shard_name(1))
        .await
        .into_result()?;
    coordinator.wait_for_cleanup().await;

    assert!(result.is_complete());
    assert!(result.gcra_keys_copied >= 1);
    assert!(result.lease_state_keys_copied >= 1);
    assert_eq!(env.router.shard_name(env.account), shard_name(1));
    assert_eq!(env.registry.phase(env.account), MigrationPhase::Idle);

    let after = env.routing.check(env.check()).await?;
    assert_eq!(after.usage, before.usage);
    assert_eq!(after.available_capacity, before.available_capacity);

    assert!(account_keys(&env.stores[0], &env.keys()).is_empty());
    assert_eq!(
        env.stores[0].zscore(&env.scavenger_key(), &env.account.to_string()).await?,
        None
    );
    assert_lease_invariants(&env.stores[1], &env.keys(), &env.scavenger_key()).await;

    for (i, lease) in granted.leases.iter().enumerate() {
        let released = env
            .routing
            .release(env.release(lease.lease_id, &format!("r{i}")))
            .await?;
        assert_eq!(released.status, ReleaseStatus::Released);
    }
    assert_eq!(env.stores[0].script_calls("release"), 0);
    Ok(())
}

#[tokio::test]
async fn dump_restore_migration_moves_every_key() -> Result<()> {
    migrates_with(Arc::new(DumpRestoreCopier)).await
}

#[tokio::test]
async fn type_aware_migration_moves_every_key() -> Result<()> {
    migrates_with(Arc::new(TypeAwareCopier)).await
}

#[tokio::test]
async fn writes_during_the_copy_are_carried_over() -> Result<()> {
    let env = two_shards();
    let lease = env.routing.acquire(env.acquire("a", &["l1"])).await?.leases[0].lease_id;

    let copier = Arc::new(HoldingCopier::default());
    let (reached, resume) = copier.hold_at(0);
    let coordinator = env.coordinator(copier);
    let router = Arc::clone(&env.router);
    let account = env.account;
    let migration = tokio::spawn(async move {
        let result = coordinator.migrate(&router, account, "shard-1").await;
        coordinator.wait_for_cleanup().await;
        result
    });
    reached.await.unwrap();
    assert_eq!(env.registry.phase(env.account), MigrationPhase::CopyingGcra);

    // Admission is gated while copying; extensions still run on the source.
    let denied = env.routing.acquire(env.acquire("b", &["l2"])).await?;
    assert!(denied.leases.is_empty());
    assert_eq!(denied.limiting_constraints.len(), env.constraints.len());
    assert!(denied.retry_after.is_some());
    let check = env.routing.check(env.check()).await?;
    assert!(check.available_capacity > 0);

    let extended = env
        .routing
        .extend_lease(env.extend(lease, "x", Duration::from_secs(10)))
        .await?;
    assert_eq!(extended.status, ExtendStatus::Extended);
    let renewed = extended.lease_id.unwrap();

    resume.send(()).unwrap();
    let result = migration.await.unwrap().into_result()?;
    assert!(result.delta_keys_copied + result.final_sync_keys >= 1);

    let index = env.keys().lease_index();
    let members: Vec<String> = env.stores[1]
        .zrange_with_scores(&index)
        .await?
        .into_iter()
        .map(|(m, _)| m)
        .collect();
    assert_eq!(members, vec![renewed.to_string()]);
    assert_lease_invariants(&env.stores[1], &env.keys(), &env.scavenger_key()).await;

    let granted = env.routing.acquire(env.acquire("c", &["l3"])).await?;
    assert_eq!(granted.leases.len(), 1);
    assert_eq!(env.stores[1].script_calls("acquire"), 1);
    Ok(())
}

#[tokio::test]
async fn check_records_written_during_the_copy_move_with_the_account() -> Result<()> {
    let env = TestEnv::builder()
        .shards(2)
        .admission_cache(false)
        .account_concurrency(5)
        .config(|c| {
            c.check_idempotency_ttl_secs = 30;
            c.migration.delta_convergence_threshold = 1_000;
        })
        .build();
    env.routing.acquire(env.acquire("a", &["l1"])).await?;
    let is_check_record = |k: &String| k.contains(":ik:chk:");

    let copier = Arc::new(HoldingCopier::default());
    let (reached, resume) = copier.hold_at(0);
    let coordinator = env.coordinator(copier);
    let router = Arc::clone(&env.router);
    let account = env.account;
    let migration = tokio::spawn(async move { coordinator.migrate(&router, account, "shard-1").await });

    // The lease-state scan has already run, so only dirty tracking can
    // carry this record over.
    reached.await.unwrap();
    assert_eq!(env.registry.phase(env.account), MigrationPhase::CopyingLeaseState);
    env.routing.check(env.check()).await?;
    assert!(account_keys(env.store(), &env.keys()).iter().any(is_check_record));

    resume.send(()).unwrap();
    let result = migration.await.unwrap().into_result()?;
    assert!(result.final_sync_keys >= 1);
    assert!(account_keys(&env.stores[1], &env.keys()).iter().any(is_check_record));
    Ok(())
}

#[tokio::test]
async fn extend_and_release_wait_out_the_final_sync() -> Result<()> {
    let env = TestEnv::builder()
        .shards(2)
        .admission_cache(false)
        .account_concurrency(5)
        .config(|c| c.migration.delta_convergence_threshold = 1_000)
        .build();
    let lease = env.routing.acquire(env.acquire("a", &["l1"])).await?.leases[0].lease_id;
    let initial_copies = account_keys(env.store(), &env.keys()).len();

    let copier = Arc::new(HoldingCopier::default());
    let (first_reached, first_resume) = copier.hold_at(0);
    let (final_reached, final_resume) = copier.hold_at(initial_copies);
    let coordinator = env.coordinator(copier);
    let router = Arc::clone(&env.router);
    let account = env.account;
    let migration = tokio::spawn(async move { coordinator.migrate(&router, account, "shard-1").await });

    first_reached.await.unwrap();
    env.routing
        .extend_lease(env.extend(lease, "x", Duration::from_secs(10)))
        .await?;
    first_resume.send(()).unwrap();

    final_reached.await.unwrap();
    assert_eq!(env.registry.phase(env.account), MigrationPhase::FinalSync);
    let err = env
        .routing
        .release(env.release(lease, "r"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MigrationInProgress { .. }));
    assert!(err.is_retryable());
    let err = env
        .routing
        .extend_lease(env.extend(lease, "x2", Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MigrationInProgress { .. }));
    let check = env.routing.check(env.check()).await?;
    assert_eq!(check.available_capacity, 0);
    assert!(check.retry_after.is_some());

    final_resume.send(()).unwrap();
    let result = migration.await.unwrap();
    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.delta_passes, 0);
    assert!(result.final_sync_keys >= 1);
    Ok(())
}

#[tokio::test]
async fn second_migration_of_the_same_account_fails() -> Result<()> {
    let env = two_shards();
    env.routing.acquire(env.acquire("a", &["l1"])).await?;

    let copier = Arc::new(HoldingCopier::default());
    let (reached, resume) = copier.hold_at(0);
    let first = env.coordinator(copier);
    let router = Arc::clone(&env.router);
    let account = env.account;
    let migration = tokio::spawn(async move { first.migrate(&router, account, "shard-1").await });
    reached.await.unwrap();

    let second = env
        .coordinator(Arc::new(DumpRestoreCopier))
        .migrate(&env.router, env.account, &shard_name(1))
        .await;
    assert!(!second.is_complete());
    assert_eq!(second.failed_phase, Some(MigrationPhase::Idle));
    assert!(matches!(
        second.into_result(),
        Err(Error::MigrationFailed { .. })
    ));

    resume.send(()).unwrap();
    assert!(migration.await.unwrap().is_complete());
    Ok(())
}

#[tokio::test]
async fn migrating_to_an_unknown_shard_leaves_the_account_in_place() -> Result<()> {
    let env = two_shards();
    env.routing.acquire(env.acquire("a", &["l1"])).await?;
    let keys_before = account_keys(env.store(), &env.keys());

    let result = env
        .coordinator(Arc::new(DumpRestoreCopier))
        .migrate(&env.router, env.account, "shard-9")
        .await;
    assert_eq!(result.phase, MigrationPhase::Failed);
    assert_eq!(env.router.shard_name(env.account), shard_name(0));
    assert_eq!(account_keys(env.store(), &env.keys()), keys_before);

    let granted = env.routing.acquire(env.acquire("b", &["l2"])).await?;
    assert_eq!(granted.leases.len(), 1);
    Ok(())
}

#[tokio::test]
async fn orphaned_custom_lease_sets_can_be_force_released() -> Result<()> {
    let env = TestEnv::builder()
        .admission_cache(false)
        .custom_concurrency(Scope::Function, "old-expression", "k", 3)
        .build();
    env.routing.acquire(env.acquire("a", &["l1", "l2"])).await?;

    let prefix = format!("{}:concurrency:", env.keys().hash_tag());
    let set = account_keys(env.store(), &env.keys())
        .into_iter()
        .find(|k| k.starts_with(&prefix))
        .expect("custom lease set exists");

    let removed = env.routing.release_orphaned_custom_keys(env.account, &set).await?;
    assert_eq!(removed, 2);
    assert!(
        env.store().zrange_with_scores(&set).await?.is_empty(),
        "lease set still populated"
    );

    let foreign = env.routing.release_orphaned_custom_keys(env.account, "other:key").await;
    assert!(matches!(foreign, Err(Error::Validation { .. })));
    Ok(())
}
