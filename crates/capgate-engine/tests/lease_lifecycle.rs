//! Lease lifecycle laws: release idempotence, extend chains, round trips,
//! and the admission cache never granting capacity.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use capgate_core::Scope;
use capgate_engine::prelude::*;
use capgate_test_utils::{TestEnv, account_keys, assert_lease_invariants, assert_no_leases, set_members};

fn env(limit: u32) -> TestEnv {
    TestEnv::builder()
        .admission_cache(false)
        .account_concurrency(limit)
        .build()
}

#[tokio::test]
async fn release_twice_matches_release_once() -> Result<()> {
    let env = env(2);
    let lease = env.manager().acquire(env.acquire("a", &["l1"])).await?.leases[0].lease_id;

    let first = env.manager().release(env.release(lease, "r1")).await?;
    assert_eq!(first.status, ReleaseStatus::Released);
    assert_eq!(first.env_id, Some(env.env));
    assert_eq!(first.function_id, Some(env.function));
    let after_one = account_keys(env.store(), &env.keys());

    let second = env.manager().release(env.release(lease, "r2")).await?;
    assert_eq!(second.status, ReleaseStatus::AlreadyCleanedUp);
    assert_eq!(account_keys(env.store(), &env.keys()), after_one);

    assert_no_leases(env.store(), &env.keys(), &env.scavenger_key()).await;
    Ok(())
}

#[tokio::test]
async fn replayed_release_reports_the_first_outcome() -> Result<()> {
    let env = env(2);
    let lease = env.manager().acquire(env.acquire("a", &["l1"])).await?.leases[0].lease_id;

    let first = env.manager().release(env.release(lease, "same")).await?;
    let second = env.manager().release(env.release(lease, "same")).await?;
    assert_eq!(first, second);
    assert_eq!(env.store().script_calls("release"), 1);
    Ok(())
}

#[tokio::test]
async fn extend_chain_then_release_leaves_no_trace() -> Result<()> {
    let env = env(2);
    let original = env.manager().acquire(env.acquire("a", &["l1"])).await?.leases[0].lease_id;

    env.advance(Duration::from_secs(3));
    let first = env
        .manager()
        .extend_lease(env.extend(original, "x1", Duration::from_secs(5)))
        .await?;
    assert_eq!(first.status, ExtendStatus::Extended);
    let renewed = first.lease_id.unwrap();
    assert_lease_invariants(env.store(), &env.keys(), &env.scavenger_key()).await;

    let stale = env
        .manager()
        .extend_lease(env.extend(original, "x-stale", Duration::from_secs(5)))
        .await?;
    assert_eq!(stale.status, ExtendStatus::Superseded);

    env.advance(Duration::from_secs(3));
    let second = env
        .manager()
        .extend_lease(env.extend(renewed, "x2", Duration::from_secs(5)))
        .await?;
    assert_eq!(second.status, ExtendStatus::Extended);
    let latest = second.lease_id.unwrap();
    assert!(latest.expiry() > renewed.expiry());

    let released = env.manager().release(env.release(latest, "r")).await?;
    assert_eq!(released.status, ReleaseStatus::Released);

    assert_no_leases(env.store(), &env.keys(), &env.scavenger_key()).await;
    Ok(())
}

#[tokio::test]
async fn extensions_never_truncate_to_the_lifetime() -> Result<()> {
    let env = env(1);
    let mut req = env.acquire("a", &["l1"]);
    req.maximum_lifetime = Duration::from_secs(8);
    let lease = env.manager().acquire(req).await?.leases[0].lease_id;

    let refused = env
        .manager()
        .extend_lease(env.extend(lease, "x", Duration::from_secs(9)))
        .await?;
    assert_eq!(refused.status, ExtendStatus::LifetimeExceeded);

    let index = set_members(env.store(), &env.keys().lease_index()).await;
    assert_eq!(index, vec![lease.to_string()]);
    Ok(())
}

#[tokio::test]
async fn acquire_release_round_trip_restores_the_index() -> Result<()> {
    let env = env(4);
    let before_index = set_members(env.store(), &env.keys().lease_index()).await;
    let scavenger = env.scavenger_key();
    let before_scavenger = set_members(env.store(), &scavenger).await;

    let granted = env
        .manager()
        .acquire(env.acquire("a", &["l1", "l2", "l3"]))
        .await?;
    assert_eq!(granted.leases.len(), 3);
    assert_lease_invariants(env.store(), &env.keys(), &scavenger).await;

    for (i, lease) in granted.leases.iter().enumerate() {
        let resp = env
            .manager()
            .release(env.release(lease.lease_id, &format!("r{i}")))
            .await?;
        assert_eq!(resp.status, ReleaseStatus::Released);
        assert_lease_invariants(env.store(), &env.keys(), &scavenger).await;
    }

    assert_eq!(set_members(env.store(), &env.keys().lease_index()).await, before_index);
    assert_eq!(set_members(env.store(), &scavenger).await, before_scavenger);
    Ok(())
}

#[tokio::test]
async fn usage_grows_by_exactly_the_granted_amount() -> Result<()> {
    let env = env(5);

    let before = env.manager().check(env.check()).await?;
    assert_eq!(before.available_capacity, 5);
    assert_eq!(before.usage[0].used, 0);

    env.manager().check(env.check()).await?;
    let granted = env.manager().acquire(env.acquire("a", &["l1", "l2"])).await?;
    env.manager().check(env.check()).await?;

    let after = env.manager().check(env.check()).await?;
    assert_eq!(granted.leases.len(), 2);
    assert_eq!(after.usage[0].used, 2);
    assert_eq!(after.usage[0].limit, 5);
    assert_eq!(after.available_capacity, 3);
    Ok(())
}

#[tokio::test]
async fn admission_cache_never_grants_after_release() -> Result<()> {
    let env = TestEnv::builder()
        .admission_cache(true)
        .account_concurrency(1)
        .build();

    let lease = env.manager().acquire(env.acquire("a1", &["l1"])).await?.leases[0].lease_id;
    env.manager().release(env.release(lease, "r1")).await?;

    // Capacity is free again, but the cached denial still stands.
    let denied = env.manager().acquire(env.acquire("a2", &["l2"])).await?;
    assert!(denied.leases.is_empty());
    assert!(denied.debug.from_admission_cache);
    assert!(set_members(env.store(), &env.keys().lease_index()).await.is_empty());

    env.advance(Duration::from_millis(1_001));
    let granted = env.manager().acquire(env.acquire("a3", &["l3"])).await?;
    assert_eq!(granted.leases.len(), 1);
    assert!(!granted.debug.from_admission_cache);
    Ok(())
}

#[tokio::test]
async fn custom_keys_are_not_cached_by_default() -> Result<()> {
    let env = TestEnv::builder()
        .admission_cache(true)
        .custom_concurrency(Scope::Function, "expr", "k", 1)
        .build();

    env.manager().acquire(env.acquire("a1", &["l1"])).await?;
    let denied = env.manager().acquire(env.acquire("a2", &["l2"])).await?;
    assert!(denied.leases.is_empty());
    assert!(!denied.debug.from_admission_cache);
    assert_eq!(env.store().script_calls("acquire"), 2);
    Ok(())
}

#[tokio::test]
async fn clock_skew_is_a_user_error() {
    let env = TestEnv::builder()
        .config(|c| c.clock_skew_threshold_ms = 1_000)
        .account_concurrency(1)
        .build();

    let mut req = env.acquire("a", &["l1"]);
    req.current_time += chrono::Duration::seconds(5);
    let err = env.manager().acquire(req).await.unwrap_err();
    assert!(matches!(err, Error::ClockSkew { .. }));
    assert!(err.is_user_error());
    assert_eq!(env.store().total_script_calls(), 0);
}

#[tokio::test]
async fn invalid_requests_never_reach_the_store() {
    let env = env(1);
    let mut req = env.acquire("a", &["l1"]);
    req.amount = 21;
    let err = env.manager().acquire(req).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(err.channel(), ErrorChannel::User);
    assert_eq!(env.store().total_script_calls(), 0);
}
