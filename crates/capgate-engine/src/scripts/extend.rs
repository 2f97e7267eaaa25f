//! `KEYS`: idempotency record, lease index, scavenger shard, current lease
//! record.
//!
//! An extension mints a new lease ID carrying the new expiry and moves every
//! reference from the old ID to it. The old ID is marked superseded so a
//! late retry with it can be told apart from a lease that is simply gone.

use capgate_core::LeaseId;
use capgate_store::{Result as StoreResult, ScriptContext};
use serde_json::Value;

use super::wire::{ExtendArgs, ExtendRecord, ExtendReply};
use super::{
    RequestState, field, key, parse_args, read_record, refresh_scavenger, to_value, write_record,
};
use crate::reply::FlexVec;
use crate::response::ExtendStatus;

const SCRIPT: &str = "extend";

pub(super) fn run(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    argv: &[String],
) -> StoreResult<Value> {
    let idempotency = key(SCRIPT, keys, 0)?;
    let index = key(SCRIPT, keys, 1)?;
    let scavenger = key(SCRIPT, keys, 2)?;
    let lease_key = key(SCRIPT, keys, 3)?;
    let args: ExtendArgs = parse_args(SCRIPT, argv)?;

    if let Some(record) = read_record::<ExtendRecord>(ctx, idempotency)? {
        return to_value(&ExtendReply {
            ih: true,
            r: record,
            w: FlexVec::default(),
        });
    }

    let now = ctx.now_ms();
    let old_id = args.id.to_string();
    let record = extend(ctx, &args, lease_key, index, scavenger, now, &old_id)?;
    write_record(ctx, idempotency, &record, args.ittl)?;

    to_value(&ExtendReply {
        ih: false,
        r: record,
        w: FlexVec(ctx.touched_keys()),
    })
}

fn extend(
    ctx: &mut ScriptContext<'_>,
    args: &ExtendArgs,
    lease_key: &str,
    index: &str,
    scavenger: &str,
    now: i64,
    old_id: &str,
) -> StoreResult<ExtendRecord> {
    let fields = ctx.hgetall(lease_key)?;
    if fields.is_empty() {
        let st = if ctx.exists(&format!("{}{old_id}", args.sp)) {
            ExtendStatus::Superseded
        } else {
            ExtendStatus::AlreadyCleanedUp
        };
        return Ok(ExtendRecord { st, id: None });
    }

    if args.id.expiry_ms() <= now {
        return Ok(ExtendRecord {
            st: ExtendStatus::Expired,
            id: None,
        });
    }

    let new_expiry = now.saturating_add(args.d);
    let created_at = fields
        .get(field::CREATED_AT)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(now);
    let max_lifetime = fields
        .get(field::MAX_LIFETIME)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(i64::MAX);
    if new_expiry > created_at.saturating_add(max_lifetime) {
        return Ok(ExtendRecord {
            st: ExtendStatus::LifetimeExceeded,
            id: None,
        });
    }

    let new_id = LeaseId::for_expiry_ms(new_expiry);
    let new = new_id.to_string();

    ctx.del(lease_key);
    ctx.hset(&format!("{}{new}", args.lp), &fields)?;
    ctx.zrem(index, old_id)?;
    ctx.zadd(index, &new, new_expiry)?;

    if let Some(request) = fields.get(field::REQUEST)
        && let Some(state) = RequestState::load(ctx, &format!("{}{request}", args.rsp))?
    {
        for set in state.lease_sets() {
            ctx.zrem(set, old_id)?;
            ctx.zadd(set, &new, new_expiry)?;
        }
    }

    ctx.set(
        &format!("{}{old_id}", args.sp),
        new.clone(),
        Some(new_expiry.saturating_sub(now).max(1)),
    );
    refresh_scavenger(ctx, index, scavenger, &args.a.to_string())?;

    Ok(ExtendRecord {
        st: ExtendStatus::Extended,
        id: Some(new_id),
    })
}
