use capgate_store::{Result as StoreResult, ScriptContext};
use serde_json::Value;

use super::wire::{OrphanReply, ReleaseArgs, ReleaseRecord, ReleaseReply};
use super::{key, parse_args, read_record, refresh_scavenger, remove_lease, to_value, write_record};
use crate::reply::FlexVec;
use crate::response::ReleaseStatus;

const SCRIPT: &str = "release";

/// `KEYS`: idempotency record, lease index, scavenger shard, lease record.
pub(super) fn run(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    argv: &[String],
) -> StoreResult<Value> {
    let idempotency = key(SCRIPT, keys, 0)?;
    let index = key(SCRIPT, keys, 1)?;
    let scavenger = key(SCRIPT, keys, 2)?;
    let lease_key = key(SCRIPT, keys, 3)?;
    let args: ReleaseArgs = parse_args(SCRIPT, argv)?;

    if let Some(record) = read_record::<ReleaseRecord>(ctx, idempotency)? {
        return to_value(&ReleaseReply {
            ih: true,
            r: record,
            w: FlexVec::default(),
        });
    }

    let removed = remove_lease(ctx, lease_key, index, &args.rsp, &args.id.to_string())?;
    refresh_scavenger(ctx, index, scavenger, &args.a.to_string())?;

    let record = match removed {
        Some(lease) => {
            let state = lease.state.unwrap_or_default();
            ReleaseRecord {
                st: ReleaseStatus::Released,
                e: state.env,
                f: state.function,
                src: state.source,
            }
        }
        None => ReleaseRecord {
            st: ReleaseStatus::AlreadyCleanedUp,
            e: None,
            f: None,
            src: None,
        },
    };
    write_record(ctx, idempotency, &record, args.ittl)?;

    to_value(&ReleaseReply {
        ih: false,
        r: record,
        w: FlexVec(ctx.touched_keys()),
    })
}

/// `KEYS`: the lease set to clear.
pub(super) fn orphans(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    _argv: &[String],
) -> StoreResult<Value> {
    let set = key("release_orphans", keys, 0)?;
    let removed = ctx.zcard(set)?;
    if removed > 0 {
        ctx.del(set);
    }
    to_value(&OrphanReply {
        n: removed,
        w: FlexVec(ctx.touched_keys()),
    })
}
