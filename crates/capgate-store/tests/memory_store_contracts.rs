//! Contract tests for the in-memory shard.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;

use capgate_core::{Clock, FakeClock, SharedClock};
use capgate_store::prelude::*;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

fn clock() -> Arc<FakeClock> {
    FakeClock::shared(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
}

fn store(clock: &Arc<FakeClock>) -> MemoryStore {
    let shared: SharedClock = clock.clone();
    MemoryStore::new("shard-0", shared)
}

fn stamp(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    _: &[String],
) -> StoreResult<serde_json::Value> {
    let now = ctx.now_ms();
    ctx.set(&keys[0], now.to_string(), Some(500));
    ctx.zadd(&keys[1], "member", now)?;
    Ok(json!({ "t": now }))
}

#[tokio::test]
async fn eval_counts_calls_and_uses_store_time() -> StoreResult<()> {
    let clock = clock();
    let store = store(&clock);
    let script = Script::new("stamp", stamp);
    let keys = vec!["{p:a}:s".to_string(), "{p:a}:z".to_string()];

    let reply = store.eval(&script, &keys, &[]).await?;
    assert_eq!(reply, format!(r#"{{"t":{}}}"#, clock.now_ms()));
    assert_eq!(store.script_calls("stamp"), 1);
    assert_eq!(store.total_script_calls(), 1);
    assert_eq!(store.pttl("{p:a}:s").await?, 500);
    assert_eq!(store.key_type("{p:a}:z").await?, KeyType::ZSet);
    Ok(())
}

#[tokio::test]
async fn keys_expire_with_the_injected_clock() -> StoreResult<()> {
    let clock = clock();
    let store = store(&clock);
    store.set("{p:a}:k", b"v".to_vec(), Some(1_000)).await?;

    clock.advance(Duration::milliseconds(999));
    assert_eq!(store.get("{p:a}:k").await?, Some(b"v".to_vec()));

    clock.advance(Duration::milliseconds(1));
    assert_eq!(store.get("{p:a}:k").await?, None);
    assert_eq!(store.key_count(), 0);
    Ok(())
}

#[tokio::test]
async fn dump_and_restore_move_keys_between_shards() -> StoreResult<()> {
    let clock = clock();
    let source = store(&clock);
    let shared: SharedClock = clock.clone();
    let destination = MemoryStore::new("shard-1", shared);

    let mut fields = BTreeMap::new();
    fields.insert("lik".to_string(), "l1".to_string());
    source.hset("{p:a}:ld:x", fields.clone()).await?;
    source.pexpire("{p:a}:ld:x", 4_000).await?;

    let payload = source.dump("{p:a}:ld:x").await?.expect("key exists");
    let ttl = source.pttl("{p:a}:ld:x").await?;
    destination.restore("{p:a}:ld:x", ttl, &payload, false).await?;

    assert_eq!(destination.hgetall("{p:a}:ld:x").await?, fields);
    assert_eq!(destination.pttl("{p:a}:ld:x").await?, 4_000);

    let err = destination
        .restore("{p:a}:ld:x", ttl, &payload, false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BusyKey { .. }));
    Ok(())
}

#[tokio::test]
async fn scan_and_unlink_cover_one_tenant() -> StoreResult<()> {
    let clock = clock();
    let store = store(&clock);
    for i in 0..25 {
        store.zadd(&format!("{{p:a}}:concurrency:a:{i}"), "l", i).await?;
        store.zadd(&format!("{{p:b}}:concurrency:a:{i}"), "l", i).await?;
    }

    let mut cursor = 0;
    let mut found = Vec::new();
    loop {
        let (next, keys) = store.scan(cursor, "{p:a}:*", 4).await?;
        found.extend(keys);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    found.sort();
    found.dedup();
    assert_eq!(found.len(), 25);

    assert_eq!(store.unlink(&found).await?, 25);
    assert_eq!(store.key_count(), 25);
    assert!(store.keys().iter().all(|k| k.starts_with("{p:b}")));
    Ok(())
}

#[tokio::test]
async fn shards_route_by_name() {
    let clock = clock();
    let shared: SharedClock = clock.clone();
    let shards = Shards::in_memory(2, &shared);
    let shard = shards.get("shard-1").expect("shard exists");
    assert_eq!(shard.name(), "shard-1");
}
