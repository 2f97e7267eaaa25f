use capgate_store::{Result as StoreResult, ScriptContext};
use serde_json::Value;

use super::wire::{CheckArgs, CheckRecord, CheckReply, UsageRecord};
use super::{assess, key, parse_args, read_record, to_value, write_record};
use crate::reply::FlexVec;

const SCRIPT: &str = "check";

pub(super) fn run(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    argv: &[String],
) -> StoreResult<Value> {
    let idempotency = key(SCRIPT, keys, 0)?;
    let args: CheckArgs = parse_args(SCRIPT, argv)?;

    if let Some(record) = read_record::<CheckRecord>(ctx, idempotency)? {
        return to_value(&CheckReply {
            ih: true,
            r: record,
            w: FlexVec::default(),
        });
    }

    let mut available = i64::MAX;
    let mut limiting = Vec::new();
    let mut usage = Vec::with_capacity(args.c.len());
    let mut retry_at: Option<i64> = None;

    for constraint in &args.c {
        let assessment = assess(ctx, constraint)?;
        available = available.min(assessment.available);
        if assessment.available == 0 {
            limiting.push(constraint.item());
            retry_at = Some(retry_at.map_or(assessment.retry_at_ms, |at| at.max(assessment.retry_at_ms)));
        }
        usage.push(UsageRecord {
            c: constraint.item(),
            u: assessment.used,
            l: assessment.limit,
        });
    }

    let record = CheckRecord {
        ac: if args.c.is_empty() { 0 } else { available },
        lc: FlexVec(limiting),
        u: FlexVec(usage),
        fr: 0,
        ra: retry_at,
    };
    write_record(ctx, idempotency, &record, args.ittl)?;
    to_value(&CheckReply {
        ih: false,
        r: record,
        w: FlexVec(ctx.touched_keys()),
    })
}
