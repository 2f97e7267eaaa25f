use std::collections::BTreeMap;
use std::sync::Arc;

use capgate_core::constraint::ConcurrencyMode;
use capgate_core::constraint_config::{ConcurrencyConfig, ThrottleConfig};
use capgate_core::{
    AccountId, AccountKeys, Clock, ConstraintConfig, ConstraintItem, EnvId, FakeClock,
    FunctionId, IdempotencyOp, KeyPrefix, LeaseId, LeaseSource, RequestId, Scope, SharedClock,
};
use capgate_store::{KeyValueStore, MemoryStore, Script};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::wire::*;
use super::*;
use crate::resolve::resolve_constraints;
use crate::response::{ExtendStatus, ReleaseStatus};

struct Fixture {
    clock: Arc<FakeClock>,
    store: MemoryStore,
    keys: AccountKeys,
    account: AccountId,
    env: EnvId,
    function: FunctionId,
    config: ConstraintConfig,
}

impl Fixture {
    fn new() -> Self {
        let clock = FakeClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let shared: SharedClock = clock.clone();
        let account = AccountId::generate();
        Self {
            store: MemoryStore::new("shard-0", shared),
            clock,
            keys: KeyPrefix::new("t").account(account),
            account,
            env: EnvId::generate(),
            function: FunctionId::generate(),
            config: ConstraintConfig {
                function_version: 1,
                concurrency: ConcurrencyConfig {
                    account_concurrency: 2,
                    function_concurrency: 5,
                    ..ConcurrencyConfig::default()
                },
                rate_limits: Vec::new(),
                throttles: vec![ThrottleConfig {
                    scope: Scope::Function,
                    limit: 1,
                    burst: 0,
                    period_secs: 60,
                    key_expression_hash: "th".into(),
                }],
            },
        }
    }

    fn resolve(&self, constraints: &[ConstraintItem]) -> Vec<SerializedConstraint> {
        resolve_constraints(&self.keys, self.env, self.function, &self.config, constraints, 1_000)
    }

    fn acquire_args(&self, constraints: &[ConstraintItem], amount: u32) -> AcquireArgs {
        AcquireArgs {
            a: self.account,
            e: self.env,
            f: self.function,
            c: self.resolve(constraints),
            n: amount,
            lk: (0..amount).map(|i| format!("lease-{i}")).collect(),
            lr: BTreeMap::new(),
            oik: "op".into(),
            rid: RequestId::at(self.clock.now()),
            d: 5_000,
            mlt: 20_000,
            bt: 0,
            ittl: 60_000,
            src: LeaseSource::default(),
            lp: self.keys.lease_prefix(),
            rsp: self.keys.request_state_prefix(),
        }
    }

    fn scavenger(&self) -> String {
        KeyPrefix::new("t").scavenger_shard(0)
    }

    async fn eval<A: Serialize, R: DeserializeOwned>(
        &self,
        script: &Script,
        keys: Vec<String>,
        args: &A,
    ) -> R {
        let raw = self
            .store
            .eval(script, &keys, &[serde_json::to_string(args).unwrap()])
            .await
            .unwrap();
        crate::reply::decode(script.name(), &raw).unwrap()
    }

    async fn acquire(&self, idempotency: &str, args: &AcquireArgs) -> AcquireReply {
        let keys = vec![
            self.keys.idempotency(IdempotencyOp::Acquire, idempotency),
            self.keys.lease_index(),
            self.scavenger(),
        ];
        self.eval(&ACQUIRE, keys, args).await
    }

    async fn release(&self, idempotency: &str, lease: LeaseId) -> ReleaseReply {
        let keys = vec![
            self.keys.idempotency(IdempotencyOp::Release, idempotency),
            self.keys.lease_index(),
            self.scavenger(),
            self.keys.lease(&lease),
        ];
        let args = ReleaseArgs {
            a: self.account,
            id: lease,
            ittl: 60_000,
            rsp: self.keys.request_state_prefix(),
        };
        self.eval(&RELEASE, keys, &args).await
    }

    async fn extend(&self, idempotency: &str, lease: LeaseId, duration_ms: i64) -> ExtendReply {
        let keys = vec![
            self.keys.idempotency(IdempotencyOp::Extend, idempotency),
            self.keys.lease_index(),
            self.scavenger(),
            self.keys.lease(&lease),
        ];
        let args = ExtendArgs {
            a: self.account,
            id: lease,
            d: duration_ms,
            ittl: 60_000,
            lp: self.keys.lease_prefix(),
            rsp: self.keys.request_state_prefix(),
            sp: self.keys.superseded_prefix(),
        };
        self.eval(&EXTEND, keys, &args).await
    }

    async fn set_members(&self, key: &str) -> Vec<String> {
        self.store
            .zrange_with_scores(key)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect()
    }

    fn advance_ms(&self, ms: i64) {
        self.clock.advance(chrono::Duration::milliseconds(ms));
    }
}

fn account_concurrency() -> ConstraintItem {
    ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account)
}

fn function_throttle() -> ConstraintItem {
    ConstraintItem::throttle(Scope::Function, "th", "fn")
}

#[tokio::test]
async fn acquire_grants_up_to_the_ceiling_and_reports_exhaustion() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[account_concurrency()], 3);

    let reply = fx.acquire("a1", &args).await;
    let record = reply.r.unwrap();
    assert!(!reply.ih);
    assert_eq!(record.l.len(), 2);
    assert_eq!(record.lc.0, vec![account_concurrency()]);
    assert_eq!(record.ec.0, vec![account_concurrency()]);
    assert_eq!(record.ra, Some(fx.clock.now_ms() + 1_000));

    let set = args.c[0].lease_set_key().unwrap().to_string();
    let mut members = fx.set_members(&set).await;
    members.sort();
    let mut granted: Vec<String> = record.l.iter().map(|l| l.id.to_string()).collect();
    granted.sort();
    assert_eq!(members, granted);
    assert!(reply.w.contains(&set));

    let denied = fx.acquire("a2", &fx.acquire_args(&[account_concurrency()], 1)).await;
    let denied = denied.r.unwrap();
    assert!(denied.l.is_empty());
    assert_eq!(denied.lc.0, vec![account_concurrency()]);
}

#[tokio::test]
async fn acquire_replays_the_recorded_outcome() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[account_concurrency()], 1);

    let first = fx.acquire("same", &args).await;
    let second = fx.acquire("same", &args).await;
    assert!(second.ih);
    assert!(second.w.is_empty());
    assert_eq!(first.r, second.r);

    let set = args.c[0].lease_set_key().unwrap();
    assert_eq!(fx.set_members(set).await.len(), 1);
}

#[tokio::test]
async fn throttle_denial_points_at_the_next_emission() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[function_throttle()], 1);

    let first = fx.acquire("t1", &args).await.r.unwrap();
    assert_eq!(first.l.len(), 1);
    assert!(first.lc.is_empty());

    let second = fx.acquire("t2", &fx.acquire_args(&[function_throttle()], 1)).await.r.unwrap();
    assert!(second.l.is_empty());
    assert_eq!(second.lc.0, vec![function_throttle()]);
    assert_eq!(second.ra, Some(fx.clock.now_ms() + 60_000));
}

#[tokio::test]
async fn blocking_threshold_reports_a_wait_without_writing() {
    let fx = Fixture::new();
    fx.acquire("fill", &fx.acquire_args(&[account_concurrency()], 2)).await;
    let before = fx.store.keys();

    let mut args = fx.acquire_args(&[account_concurrency()], 1);
    args.bt = 1_500;
    let reply = fx.acquire("blocked", &args).await;
    assert_eq!(reply.wt, Some(fx.clock.now_ms() + 1_000));
    assert!(reply.r.is_none());
    assert_eq!(fx.store.keys(), before);
}

#[tokio::test]
async fn release_drops_every_reference_once() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[account_concurrency()], 1);
    let lease = fx.acquire("a", &args).await.r.unwrap().l[0].id;

    let released = fx.release("r1", lease).await;
    assert_eq!(released.r.st, ReleaseStatus::Released);
    assert_eq!(released.r.e, Some(fx.env));
    assert!(fx.set_members(args.c[0].lease_set_key().unwrap()).await.is_empty());
    assert!(fx.set_members(&fx.keys.lease_index()).await.is_empty());
    assert!(fx.set_members(&fx.scavenger()).await.is_empty());

    let again = fx.release("r2", lease).await;
    assert_eq!(again.r.st, ReleaseStatus::AlreadyCleanedUp);
}

#[tokio::test]
async fn extend_moves_the_lease_and_supersedes_the_old_id() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[account_concurrency()], 1);
    let old = fx.acquire("a", &args).await.r.unwrap().l[0].id;

    fx.advance_ms(1_000);
    let extended = fx.extend("e1", old, 5_000).await;
    assert_eq!(extended.r.st, ExtendStatus::Extended);
    let new = extended.r.id.unwrap();
    assert_eq!(new.expiry_ms(), fx.clock.now_ms() + 5_000);

    let set = args.c[0].lease_set_key().unwrap();
    assert_eq!(fx.set_members(set).await, vec![new.to_string()]);
    assert_eq!(fx.set_members(&fx.keys.lease_index()).await, vec![new.to_string()]);

    let stale = fx.extend("e2", old, 5_000).await;
    assert_eq!(stale.r.st, ExtendStatus::Superseded);
    assert!(stale.r.id.is_none());
}

#[tokio::test]
async fn extend_refuses_expired_and_overlong_leases() {
    let fx = Fixture::new();
    let lease = fx
        .acquire("a", &fx.acquire_args(&[account_concurrency()], 1))
        .await
        .r
        .unwrap()
        .l[0]
        .id;

    // Created at t0 with a 20s lifetime: t0+16s+5s overshoots.
    fx.advance_ms(4_000);
    let lease = fx.extend("e1", lease, 5_000).await.r.id.unwrap();
    fx.advance_ms(4_000);
    let lease = fx.extend("e2", lease, 5_000).await.r.id.unwrap();
    fx.advance_ms(4_000);
    let lease = fx.extend("e3", lease, 5_000).await.r.id.unwrap();
    fx.advance_ms(4_000);
    let overlong = fx.extend("e4", lease, 5_000).await;
    assert_eq!(overlong.r.st, ExtendStatus::LifetimeExceeded);

    fx.advance_ms(2_000);
    let expired = fx.extend("e5", lease, 2_000).await;
    assert_eq!(expired.r.st, ExtendStatus::Expired);
}

#[tokio::test]
async fn reclaim_removes_only_expired_leases() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[account_concurrency()], 1);
    let reply = fx.acquire("a", &args).await.r.unwrap();
    let lease = reply.l[0].id;

    let peek_keys = vec![fx.scavenger()];
    let early: PeekReply = fx.eval(&PEEK_SCAVENGER, peek_keys.clone(), &PeekArgs { max: 10 }).await;
    assert!(early.a.is_empty());
    assert_eq!(early.t, 1);

    fx.advance_ms(6_000);
    let due: PeekReply = fx.eval(&PEEK_SCAVENGER, peek_keys, &PeekArgs { max: 10 }).await;
    assert_eq!(due.a.len(), 1);
    assert_eq!(due.a[0].a, fx.account.to_string());

    let reclaimed: ReclaimReply = fx
        .eval(
            &RECLAIM,
            vec![fx.keys.lease_index(), fx.scavenger()],
            &ReclaimArgs {
                a: fx.account,
                lp: fx.keys.lease_prefix(),
                rsp: fx.keys.request_state_prefix(),
                max: 100,
            },
        )
        .await;
    assert_eq!(reclaimed.te, 1);
    assert_eq!(reclaimed.l.len(), 1);
    assert_eq!(reclaimed.l[0].id, lease);
    assert_eq!(reclaimed.l[0].k, "lease-0");
    assert!(fx.set_members(args.c[0].lease_set_key().unwrap()).await.is_empty());
    assert!(fx.set_members(&fx.scavenger()).await.is_empty());
}

#[tokio::test]
async fn check_reports_usage_without_consuming() {
    let fx = Fixture::new();
    fx.acquire("a", &fx.acquire_args(&[account_concurrency()], 1)).await;

    let args = CheckArgs {
        c: fx.resolve(&[account_concurrency(), function_throttle()]),
        ittl: 0,
    };
    for _ in 0..2 {
        let reply: CheckReply = fx.eval(&CHECK, vec![String::new()], &args).await;
        assert!(!reply.ih);
        assert_eq!(reply.r.ac, 1);
        assert!(reply.r.lc.is_empty());
        let usage: Vec<(i64, i64)> = reply.r.u.iter().map(|u| (u.u, u.l)).collect();
        assert_eq!(usage, vec![(0, 1), (1, 2)]);
    }
}

#[tokio::test]
async fn orphan_release_clears_the_whole_set() {
    let fx = Fixture::new();
    let args = fx.acquire_args(&[account_concurrency()], 2);
    fx.acquire("a", &args).await;
    let set = args.c[0].lease_set_key().unwrap().to_string();

    let reply: OrphanReply = fx.eval(&RELEASE_ORPHANS, vec![set.clone()], &()).await;
    assert_eq!(reply.n, 2);
    assert_eq!(reply.w.0, vec![set.clone()]);
    assert!(fx.set_members(&set).await.is_empty());
}
