use capgate_store::{Result as StoreResult, ScriptContext};
use serde_json::Value;

use super::wire::{
    PeekArgs, PeekReply, PeekedAccount, ReclaimArgs, ReclaimReply, ReclaimedRecord,
};
use super::{field, key, parse_args, refresh_scavenger, remove_lease, to_value};
use crate::reply::FlexVec;

/// `KEYS`: lease index, scavenger shard.
pub(super) fn run(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    argv: &[String],
) -> StoreResult<Value> {
    const SCRIPT: &str = "reclaim";

    let index = key(SCRIPT, keys, 0)?;
    let scavenger = key(SCRIPT, keys, 1)?;
    let args: ReclaimArgs = parse_args(SCRIPT, argv)?;
    let now = ctx.now_ms();

    let total_expired = ctx.zcount(index, i64::MIN, now)?;
    let expired = ctx.zrange_by_score(index, i64::MIN, now, Some(args.max))?;

    let mut reclaimed = Vec::with_capacity(expired.len());
    for (id, _) in expired {
        let lease_key = format!("{}{id}", args.lp);
        let removed = remove_lease(ctx, &lease_key, index, &args.rsp, &id)?;
        // Index entries whose ID no longer parses are dropped silently.
        let Ok(lease_id) = id.parse() else {
            continue;
        };
        let Some(lease) = removed else {
            continue;
        };
        let state = lease.state.unwrap_or_default();
        reclaimed.push(ReclaimedRecord {
            id: lease_id,
            k: lease.fields.get(field::LEASE_KEY).cloned().unwrap_or_default(),
            run: lease.fields.get(field::RUN).and_then(|r| r.parse().ok()),
            e: state.env,
            f: state.function,
            src: state.source,
        });
    }

    refresh_scavenger(ctx, index, scavenger, &args.a.to_string())?;

    to_value(&ReclaimReply {
        te: total_expired,
        l: FlexVec(reclaimed),
        w: FlexVec(ctx.touched_keys()),
    })
}

/// `KEYS`: scavenger shard.
pub(super) fn peek(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    argv: &[String],
) -> StoreResult<Value> {
    const SCRIPT: &str = "peek_scavenger";

    let shard = key(SCRIPT, keys, 0)?;
    let args: PeekArgs = parse_args(SCRIPT, argv)?;
    let now = ctx.now_ms();

    let accounts = ctx
        .zrange_by_score(shard, i64::MIN, now, Some(args.max))?
        .into_iter()
        .map(|(a, s)| PeekedAccount { a, s })
        .collect();

    to_value(&PeekReply {
        a: FlexVec(accounts),
        te: ctx.zcount(shard, i64::MIN, now)?,
        t: ctx.zcard(shard)?,
    })
}
