//! Server-side admission scripts.
//!
//! Each capacity operation is one script invocation against the shard that
//! owns the account, so every key it reads or writes is observed atomically.
//! All keys an invocation touches share the account hash tag.
//!
//! | Script | Purpose |
//! |--------|---------|
//! | [`ACQUIRE`] | Evaluate constraints, grant leases, record the outcome |
//! | [`CHECK`] | Read-only capacity report |
//! | [`EXTEND`] | Replace a lease with a later-expiring one |
//! | [`RELEASE`] | Drop a lease and its constraint slots |
//! | [`RECLAIM`] | Drop expired leases of one account |
//! | [`PEEK_SCAVENGER`] | List accounts with expired leases in one scavenger shard |
//! | [`RELEASE_ORPHANS`] | Clear a concurrency lease set nothing resolves to anymore |

mod acquire;
mod check;
mod extend;
mod reclaim;
mod release;
pub mod wire;

use std::collections::BTreeMap;

use capgate_core::{EnvId, FunctionId, LeaseSource};
use capgate_store::{Error as StoreError, Result as StoreResult, Script, ScriptContext};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::gcra::{self, Resolution};
use crate::resolve::{SerializedConstraint, SerializedGcra};

/// Acquire script.
pub const ACQUIRE: Script = Script::new("acquire", acquire::run);
/// Check script.
pub const CHECK: Script = Script::new("check", check::run);
/// Extend script.
pub const EXTEND: Script = Script::new("extend", extend::run);
/// Release script.
pub const RELEASE: Script = Script::new("release", release::run);
/// Reclaim script.
pub const RECLAIM: Script = Script::new("reclaim", reclaim::run);
/// Scavenger peek script.
pub const PEEK_SCAVENGER: Script = Script::new("peek_scavenger", reclaim::peek);
/// Orphaned lease-set release script.
pub const RELEASE_ORPHANS: Script = Script::new("release_orphans", release::orphans);

/// Request state hash fields.
mod field {
    pub const CONSTRAINTS: &str = "c";
    pub const ENV: &str = "e";
    pub const FUNCTION: &str = "f";
    pub const SOURCE: &str = "src";
    pub const LIVE_LEASES: &str = "n";
    pub const ACCOUNT: &str = "a";

    pub const LEASE_KEY: &str = "lik";
    pub const RUN: &str = "rid";
    pub const REQUEST: &str = "req";
    pub const OPERATION_KEY: &str = "oik";
    pub const CREATED_AT: &str = "cat";
    pub const MAX_LIFETIME: &str = "mlt";
}

fn parse_args<T: DeserializeOwned>(script: &str, argv: &[String]) -> StoreResult<T> {
    let raw = argv
        .first()
        .ok_or_else(|| StoreError::script(script, "missing arguments"))?;
    serde_json::from_str(raw)
        .map_err(|e| StoreError::script(script, format!("invalid arguments: {e}")))
}

fn key<'a>(script: &str, keys: &'a [String], index: usize) -> StoreResult<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::script(script, format!("missing KEYS[{}]", index + 1)))
}

fn to_value<T: Serialize>(value: &T) -> StoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Reads a memoized record.
fn read_record<T: DeserializeOwned>(ctx: &ScriptContext<'_>, key: &str) -> StoreResult<Option<T>> {
    if key.is_empty() {
        return Ok(None);
    }
    match ctx.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Memoizes a record; a zero TTL or empty key skips the write.
fn write_record<T: Serialize>(
    ctx: &mut ScriptContext<'_>,
    key: &str,
    record: &T,
    ttl_ms: i64,
) -> StoreResult<()> {
    if key.is_empty() || ttl_ms <= 0 {
        return Ok(());
    }
    ctx.set(key, serde_json::to_string(record)?, Some(ttl_ms));
    Ok(())
}

/// Points the account's scavenger entry at its earliest lease, or removes
/// it when the account holds none.
fn refresh_scavenger(
    ctx: &mut ScriptContext<'_>,
    index: &str,
    scavenger: &str,
    account: &str,
) -> StoreResult<()> {
    match ctx.zmin(index)? {
        Some((_, earliest)) => {
            ctx.zadd(scavenger, account, earliest)?;
        }
        None => {
            ctx.zrem(scavenger, account)?;
        }
    }
    Ok(())
}

/// The request state shared by the leases of one acquire.
#[derive(Debug, Default)]
struct RequestState {
    constraints: Vec<SerializedConstraint>,
    env: Option<EnvId>,
    function: Option<FunctionId>,
    source: Option<LeaseSource>,
}

impl RequestState {
    fn load(ctx: &ScriptContext<'_>, key: &str) -> StoreResult<Option<Self>> {
        let fields = ctx.hgetall(key)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let constraints = match fields.get(field::CONSTRAINTS) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        let source = match fields.get(field::SOURCE) {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(Some(Self {
            constraints,
            env: fields.get(field::ENV).and_then(|e| e.parse().ok()),
            function: fields.get(field::FUNCTION).and_then(|f| f.parse().ok()),
            source,
        }))
    }

    fn lease_sets(&self) -> impl Iterator<Item = &str> + '_ {
        self.constraints
            .iter()
            .filter_map(SerializedConstraint::lease_set_key)
    }
}

/// A lease removed from every index that referenced it.
#[derive(Debug)]
struct RemovedLease {
    fields: BTreeMap<String, String>,
    state: Option<RequestState>,
}

/// Removes a lease: its index entry, its constraint slots and its record.
///
/// The request state loses one live lease and disappears with its last one.
/// Returns `None` when no record exists; the index entry is dropped anyway.
fn remove_lease(
    ctx: &mut ScriptContext<'_>,
    lease_key: &str,
    index: &str,
    request_state_prefix: &str,
    lease_id: &str,
) -> StoreResult<Option<RemovedLease>> {
    ctx.zrem(index, lease_id)?;
    let fields = ctx.hgetall(lease_key)?;
    if fields.is_empty() {
        return Ok(None);
    }

    let mut state = None;
    if let Some(request) = fields.get(field::REQUEST) {
        let state_key = format!("{request_state_prefix}{request}");
        state = RequestState::load(ctx, &state_key)?;
        if let Some(loaded) = &state {
            let sets: Vec<String> = loaded.lease_sets().map(str::to_string).collect();
            for set in sets {
                ctx.zrem(&set, lease_id)?;
            }
            let live = ctx
                .hget(&state_key, field::LIVE_LEASES)?
                .and_then(|n| n.parse::<i64>().ok())
                .unwrap_or(1)
                - 1;
            if live <= 0 {
                ctx.del(&state_key);
            } else {
                ctx.hset(&state_key, [(field::LIVE_LEASES, live.to_string())])?;
            }
        }
    }

    ctx.del(lease_key);
    Ok(Some(RemovedLease { fields, state }))
}

/// Capacity of one constraint as of script time.
#[derive(Debug, Clone, Copy)]
struct Assessment {
    available: i64,
    used: i64,
    limit: i64,
    /// When capacity is expected back, unix milliseconds.
    retry_at_ms: i64,
}

/// Counts members of a sorted set that have not expired yet.
fn live_members(ctx: &ScriptContext<'_>, key: &str, now_ms: i64) -> StoreResult<i64> {
    if key.is_empty() {
        return Ok(0);
    }
    let count = ctx.zcount(key, now_ms.saturating_add(1), i64::MAX)?;
    Ok(i64::try_from(count).unwrap_or(i64::MAX))
}

/// Probes a constraint without consuming capacity.
fn assess(ctx: &mut ScriptContext<'_>, constraint: &SerializedConstraint) -> StoreResult<Assessment> {
    let now_ms = ctx.now_ms();
    match constraint {
        SerializedConstraint::Concurrency(c) => {
            let used = live_members(ctx, &c.in_progress_leases_key, now_ms)?
                + live_members(ctx, &c.in_progress_item_key, now_ms)?;
            Ok(Assessment {
                available: (c.limit - used).max(0),
                used,
                limit: c.limit,
                retry_at_ms: now_ms.saturating_add(c.retry_after_ms),
            })
        }
        SerializedConstraint::Throttle(g) => assess_gcra(ctx, g, Resolution::Millis),
        SerializedConstraint::RateLimit(g) => assess_gcra(ctx, g, Resolution::Nanos),
    }
}

fn assess_gcra(
    ctx: &mut ScriptContext<'_>,
    constraint: &SerializedGcra,
    resolution: Resolution,
) -> StoreResult<Assessment> {
    let outcome = gcra::apply(ctx, &constraint.key, resolution, constraint.params(), 0)?;
    Ok(Assessment {
        available: outcome.remaining,
        used: outcome.used(),
        limit: outcome.limit,
        retry_at_ms: resolution.to_ms_ceil(outcome.retry_at),
    })
}

#[cfg(test)]
mod tests;
