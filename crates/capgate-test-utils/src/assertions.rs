//! Lease invariant assertions.
//!
//! Each helper reads the store directly, bypassing the engine, so a bug in
//! the scripts cannot hide itself.

use capgate_core::{AccountKeys, LeaseId};
use capgate_engine::resolve::SerializedConstraint;
use capgate_store::{KeyValueStore, MemoryStore};

/// Asserts the lease invariants of one account:
///
/// - every indexed lease ID embeds the expiry it is indexed under
/// - a lease is indexed exactly when its record exists
/// - every lease sits in the lease set of each concurrency constraint that
///   granted it
/// - the scavenger entry equals the earliest indexed expiry, and is absent
///   when the index is empty
///
/// # Panics
///
/// Panics on the first violated invariant.
pub async fn assert_lease_invariants(store: &MemoryStore, keys: &AccountKeys, scavenger_key: &str) {
    let index = store.zrange_with_scores(&keys.lease_index()).await.unwrap();

    for (id, score) in &index {
        let lease: LeaseId = id.parse().unwrap_or_else(|e| panic!("index member {id}: {e}"));
        assert_eq!(lease.expiry_ms(), *score, "lease {id} indexed under a different expiry");

        let record = store.hgetall(&keys.lease(&lease)).await.unwrap();
        assert!(!record.is_empty(), "indexed lease {id} has no record");

        if let Some(request) = record.get("req") {
            let state = store
                .hgetall(&format!("{}{request}", keys.request_state_prefix()))
                .await
                .unwrap();
            let constraints: Vec<SerializedConstraint> = state
                .get("c")
                .map(|raw| serde_json::from_str(raw).unwrap())
                .unwrap_or_default();
            for set in constraints.iter().filter_map(SerializedConstraint::lease_set_key) {
                assert_eq!(
                    store.zscore(set, id).await.unwrap(),
                    Some(*score),
                    "lease {id} missing from lease set {set}"
                );
            }
        }
    }

    let lease_prefix = keys.lease_prefix();
    for key in store.keys() {
        if let Some(id) = key.strip_prefix(&lease_prefix) {
            assert!(
                index.iter().any(|(member, _)| member == id),
                "lease record {key} is not indexed"
            );
        }
    }

    let member = keys.account_id().to_string();
    let score = store.zscore(scavenger_key, &member).await.unwrap();
    let earliest = index.iter().map(|(_, s)| *s).min();
    assert_eq!(score, earliest, "scavenger entry does not match the earliest lease");
}

/// Asserts that the account holds no lease anywhere: no index entries, no
/// lease records, no request state, no lease-set members and no scavenger
/// entry.
///
/// # Panics
///
/// Panics when any lease state remains.
pub async fn assert_no_leases(store: &MemoryStore, keys: &AccountKeys, scavenger_key: &str) {
    let tag = keys.hash_tag();
    let leftovers: Vec<String> = store
        .keys()
        .into_iter()
        .filter(|k| {
            k.starts_with(&keys.lease_prefix())
                || k.starts_with(&keys.request_state_prefix())
                || k.starts_with(&format!("{tag}:concurrency:"))
                || *k == keys.lease_index()
        })
        .collect();
    assert!(leftovers.is_empty(), "lease state left behind: {leftovers:?}");

    let member = keys.account_id().to_string();
    assert_eq!(
        store.zscore(scavenger_key, &member).await.unwrap(),
        None,
        "account still registered with the scavenger"
    );
}

/// Members of a sorted set, lowest score first.
///
/// # Panics
///
/// Panics if the key is not a sorted set.
pub async fn set_members(store: &MemoryStore, key: &str) -> Vec<String> {
    store
        .zrange_with_scores(key)
        .await
        .unwrap()
        .into_iter()
        .map(|(member, _)| member)
        .collect()
}

/// Every key of the account, sorted.
#[must_use]
pub fn account_keys(store: &MemoryStore, keys: &AccountKeys) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with(keys.hash_tag()))
        .collect()
}
