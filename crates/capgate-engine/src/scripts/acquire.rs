//! `KEYS`: idempotency record, lease index, scavenger shard.

use capgate_core::LeaseId;
use capgate_store::{Error as StoreError, Result as StoreResult, ScriptContext};
use serde_json::Value;

use super::wire::{AcquireArgs, AcquireRecord, AcquireReply, GrantedLease};
use super::{
    Assessment, assess, field, key, parse_args, read_record, refresh_scavenger, to_value,
    write_record,
};
use crate::gcra;
use crate::reply::FlexVec;
use crate::resolve::SerializedConstraint;

const SCRIPT: &str = "acquire";

pub(super) fn run(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    argv: &[String],
) -> StoreResult<Value> {
    let idempotency = key(SCRIPT, keys, 0)?;
    let index = key(SCRIPT, keys, 1)?;
    let scavenger = key(SCRIPT, keys, 2)?;
    let args: AcquireArgs = parse_args(SCRIPT, argv)?;

    if let Some(record) = read_record::<AcquireRecord>(ctx, idempotency)? {
        return to_value(&AcquireReply {
            ih: true,
            wt: None,
            r: Some(record),
            w: FlexVec::default(),
        });
    }

    let now = ctx.now_ms();
    let amount = i64::from(args.n);
    let mut lines = Vec::with_capacity(args.c.len() + 1);

    let mut assessments = Vec::with_capacity(args.c.len());
    for constraint in &args.c {
        let assessment = assess(ctx, constraint)?;
        lines.push(format!(
            "{} used={} limit={} available={}",
            constraint.item(),
            assessment.used,
            assessment.limit,
            assessment.available
        ));
        assessments.push(assessment);
    }

    let available = assessments
        .iter()
        .map(|a| a.available)
        .min()
        .unwrap_or(0);
    let grant = available.min(amount).max(0);
    let limiting: Vec<usize> = assessments
        .iter()
        .enumerate()
        .filter(|(_, a)| a.available < amount)
        .map(|(i, _)| i)
        .collect();

    if grant == 0 && args.bt > 0 {
        let retry_at = latest_retry(&assessments, &limiting);
        if let Some(at) = retry_at.filter(|at| at.saturating_sub(now) <= args.bt) {
            return to_value(&AcquireReply {
                ih: false,
                wt: Some(at),
                r: None,
                w: FlexVec::default(),
            });
        }
    }

    let mut leases = Vec::new();
    let mut post_grant = assessments.clone();
    if grant > 0 {
        let expiry = now.saturating_add(args.d);
        leases = args
            .lk
            .iter()
            .take(usize::try_from(grant).unwrap_or(0))
            .map(|k| GrantedLease {
                id: LeaseId::for_expiry_ms(expiry),
                k: k.clone(),
            })
            .collect();

        for (i, constraint) in args.c.iter().enumerate() {
            match constraint {
                SerializedConstraint::Concurrency(c) => {
                    for lease in &leases {
                        ctx.zadd(&c.in_progress_leases_key, &lease.id.to_string(), expiry)?;
                    }
                    post_grant[i].available = (post_grant[i].available - grant).max(0);
                }
                SerializedConstraint::Throttle(_) | SerializedConstraint::RateLimit(_) => {
                    let Some((g, resolution)) = constraint.gcra() else {
                        continue;
                    };
                    let outcome = gcra::apply(ctx, &g.key, resolution, g.params(), grant)?;
                    if outcome.limited {
                        return Err(StoreError::script(
                            SCRIPT,
                            format!("{} limited during grant", constraint.item()),
                        ));
                    }
                    let after = gcra::apply(ctx, &g.key, resolution, g.params(), 0)?;
                    post_grant[i] = Assessment {
                        available: after.remaining,
                        used: after.used(),
                        limit: after.limit,
                        retry_at_ms: resolution.to_ms_ceil(after.retry_at),
                    };
                }
            }
        }

        let request = args.rid.to_string();
        for lease in &leases {
            let id = lease.id.to_string();
            let mut record = vec![
                (field::LEASE_KEY, lease.k.clone()),
                (field::REQUEST, request.clone()),
                (field::OPERATION_KEY, args.oik.clone()),
                (field::CREATED_AT, now.to_string()),
                (field::MAX_LIFETIME, args.mlt.to_string()),
            ];
            if let Some(run) = args.lr.get(&lease.k) {
                record.push((field::RUN, run.to_string()));
            }
            ctx.hset(&format!("{}{id}", args.lp), record)?;
            ctx.zadd(index, &id, expiry)?;
        }

        ctx.hset(
            &format!("{}{request}", args.rsp),
            [
                (field::CONSTRAINTS, serde_json::to_string(&args.c)?),
                (field::ENV, args.e.to_string()),
                (field::FUNCTION, args.f.to_string()),
                (field::SOURCE, serde_json::to_string(&args.src)?),
                (field::LIVE_LEASES, leases.len().to_string()),
                (field::ACCOUNT, args.a.to_string()),
            ],
        )?;
        refresh_scavenger(ctx, index, scavenger, &args.a.to_string())?;
    }

    // Only the most specific constraint left without capacity is reported.
    let exhausted = post_grant
        .iter()
        .rposition(|a| a.available == 0)
        .map(|i| args.c[i].item());

    let retry_at = latest_retry(&post_grant, &limiting);
    lines.push(format!("granted={grant} requested={amount}"));

    let record = AcquireRecord {
        rid: args.rid,
        l: FlexVec(leases),
        lc: FlexVec(limiting.iter().map(|&i| args.c[i].item()).collect()),
        ec: FlexVec(exhausted.into_iter().collect()),
        fr: 0,
        ra: retry_at,
        dl: FlexVec(lines),
    };
    write_record(ctx, idempotency, &record, args.ittl)?;

    to_value(&AcquireReply {
        ih: false,
        wt: None,
        r: Some(record),
        w: FlexVec(ctx.touched_keys()),
    })
}

/// The latest retry time among limiting constraints.
fn latest_retry(assessments: &[Assessment], limiting: &[usize]) -> Option<i64> {
    limiting
        .iter()
        .filter_map(|&i| assessments.get(i))
        .map(|a| a.retry_at_ms)
        .max()
}
