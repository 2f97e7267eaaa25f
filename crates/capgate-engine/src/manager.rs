//! The capacity manager: validation, caches and one script call per
//! operation.
//!
//! ```text
//! request ─► validate ─► clock skew ─► local replay ─► admission cache ─► script
//!                                        (acquire/extend/release)  (acquire)
//! ```
//!
//! Everything that decides admission happens inside the script; the manager
//! only short-circuits calls whose outcome it already knows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capgate_core::observability::capacity_span;
use capgate_core::{
    AccountId, AccountKeys, CapacityConfig, IdempotencyOp, RequestId, SharedClock,
    constraint_fingerprint, scavenger_shard_index,
};
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::admission_cache::AdmissionCache;
use crate::dispatch::{DispatchTarget, Dispatcher};
use crate::duplicate_tracker::DuplicateTracker;
use crate::error::{Error, Result};
use crate::idempotency::LocalIdempotencyCache;
use crate::metrics::{CapacityMetrics, time_operation};
use crate::request::{AcquireRequest, CheckRequest, ExtendLeaseRequest, ReleaseRequest};
use crate::resolve::resolve_constraints;
use crate::response::{
    AcquireDebug, AcquireResponse, CapacityLease, CheckResponse, ConstraintUsage,
    ExtendLeaseResponse, ReleaseResponse,
};
use crate::scripts::wire::{
    AcquireArgs, AcquireReply, CheckArgs, CheckReply, ExtendArgs, ExtendReply, OrphanReply,
    ReleaseArgs, ReleaseReply,
};
use crate::scripts;
use crate::validation::{
    check_clock_skew, validate_acquire, validate_check, validate_extend, validate_release,
};

/// The four capacity operations.
///
/// Dropping a returned future abandons the call. A script that already
/// committed stays committed; retrying with the same idempotency key
/// returns its recorded outcome.
#[async_trait]
pub trait CapacityManager: Send + Sync {
    /// Reports available capacity without consuming any.
    async fn check(&self, req: CheckRequest) -> Result<CheckResponse>;

    /// Grants up to `amount` leases.
    async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResponse>;

    /// Replaces a lease with one expiring later.
    async fn extend_lease(&self, req: ExtendLeaseRequest) -> Result<ExtendLeaseResponse>;

    /// Releases a lease.
    async fn release(&self, req: ReleaseRequest) -> Result<ReleaseResponse>;
}

/// An operation outcome together with the store keys it wrote.
#[derive(Debug, Clone)]
pub struct Executed<T> {
    /// The response returned to the caller.
    pub response: T,
    /// Keys the script wrote, empty for replays and cache hits.
    pub written_keys: Vec<String>,
}

impl<T> Executed<T> {
    fn unwritten(response: T) -> Self {
        Self {
            response,
            written_keys: Vec::new(),
        }
    }
}

/// [`CapacityManager`] backed by one [`Dispatcher`].
#[derive(Debug)]
pub struct StoreCapacityManager {
    config: Arc<CapacityConfig>,
    clock: SharedClock,
    dispatcher: Dispatcher,
    admission_cache: Arc<AdmissionCache>,
    acquired: LocalIdempotencyCache<AcquireResponse>,
    extended: LocalIdempotencyCache<ExtendLeaseResponse>,
    released: LocalIdempotencyCache<ReleaseResponse>,
    duplicates: DuplicateTracker,
    metrics: CapacityMetrics,
}

impl StoreCapacityManager {
    /// Creates a manager with caches configured from `config`.
    #[must_use]
    pub fn new(config: Arc<CapacityConfig>, clock: SharedClock, dispatcher: Dispatcher) -> Self {
        let ttl = config.operation_idempotency_ttl();
        Self {
            admission_cache: Arc::new(AdmissionCache::from_config(
                clock.clone(),
                &config.admission_cache,
            )),
            acquired: LocalIdempotencyCache::new(ttl, clock.clone()),
            extended: LocalIdempotencyCache::new(ttl, clock.clone()),
            released: LocalIdempotencyCache::new(ttl, clock.clone()),
            duplicates: DuplicateTracker::with_metrics(config.duplicate_tracker_window()),
            dispatcher: dispatcher.with_timeout(config.operation_timeout()),
            metrics: CapacityMetrics::new(),
            config,
            clock,
        }
    }

    /// Replaces the admission cache, e.g. to share one across shards or to
    /// inject custom predicates.
    #[must_use]
    pub fn with_admission_cache(mut self, cache: Arc<AdmissionCache>) -> Self {
        self.admission_cache = cache;
        self
    }

    /// Replaces the duplicate tracker.
    #[must_use]
    pub fn with_duplicate_tracker(mut self, tracker: DuplicateTracker) -> Self {
        self.duplicates = tracker;
        self
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &CapacityConfig {
        &self.config
    }

    /// The dispatcher in use.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stops background timers.
    pub fn shutdown(&self) {
        self.duplicates.shutdown();
    }

    fn scavenger_shard_key(&self, target: &DispatchTarget, account: AccountId) -> String {
        target
            .prefix
            .scavenger_shard(scavenger_shard_index(account, self.config.num_scavenger_shards))
    }

    fn check_skew(&self, caller: DateTime<Utc>) -> Result<()> {
        check_clock_skew(
            caller,
            self.clock.now(),
            self.config.clock_skew_threshold_ms,
            self.config.reject_at_threshold,
        )
    }

    fn record_ttl_ms(ttl: Duration) -> i64 {
        i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Runs a check and reports the keys it wrote; only the idempotency
    /// record is ever written.
    ///
    /// # Errors
    ///
    /// Returns a user error for invalid requests or clock skew, an internal
    /// error when the store call fails.
    pub async fn check_inner(&self, req: &CheckRequest) -> Result<Executed<CheckResponse>> {
        validate_check(req)?;
        self.check_skew(req.current_time)?;

        let target = self.dispatcher.resolve(&req.migration)?;
        let keys = target.prefix.account(req.account_id);
        let constraints = resolve_constraints(
            &keys,
            req.env_id,
            req.function_id,
            &req.configuration,
            &req.constraints,
            self.config.concurrency_retry_after_ms,
        );

        let ttl = self.config.check_idempotency_ttl();
        let idempotency = if ttl.is_zero() {
            String::new()
        } else {
            let fingerprint = constraint_fingerprint(
                req.account_id,
                req.env_id,
                req.function_id,
                &req.configuration,
                &req.constraints,
            );
            keys.idempotency(IdempotencyOp::Check, &fingerprint)
        };
        let args = CheckArgs {
            c: constraints,
            ittl: Self::record_ttl_ms(ttl),
        };

        let reply: CheckReply = self
            .dispatcher
            .eval(target, &scripts::CHECK, &[idempotency], &[encode(&args)?])
            .await?;
        let record = reply.r;

        let response = CheckResponse {
            available_capacity: clamp_u32(record.ac),
            limiting_constraints: record.lc.into_inner(),
            usage: record
                .u
                .into_inner()
                .into_iter()
                .map(|u| ConstraintUsage {
                    constraint: u.c,
                    used: clamp_u32(u.u),
                    limit: clamp_u32(u.l),
                })
                .collect(),
            fairness_reduction: record.fr,
            retry_after: record.ra.and_then(DateTime::from_timestamp_millis),
            idempotent_replay: reply.ih,
        };
        Ok(Executed {
            response,
            written_keys: reply.w.into_inner(),
        })
    }

    /// Runs an acquire and reports the keys it wrote.
    ///
    /// # Errors
    ///
    /// Returns a user error for invalid requests or clock skew, an internal
    /// error when the store call fails or its reply does not decode.
    pub async fn acquire_inner(&self, req: &AcquireRequest) -> Result<Executed<AcquireResponse>> {
        validate_acquire(req)?;
        self.check_skew(req.current_time)?;
        let account = req.account_id;

        if let Some(mut cached) = self.acquired.get(account, &req.idempotency_key) {
            cached.debug.idempotent_replay = true;
            self.metrics.record_operation("acquire", "replayed");
            return Ok(Executed::unwritten(cached));
        }

        let fingerprint = constraint_fingerprint(
            account,
            req.env_id,
            req.function_id,
            &req.configuration,
            &req.constraints,
        );
        self.duplicates.track(account, &fingerprint);

        if let Some(hit) =
            self.admission_cache
                .lookup(account, req.env_id, req.function_id, &req.constraints)
        {
            self.metrics.record_admission_cache_hit();
            self.metrics.record_operation("acquire", "cached");
            tracing::debug!(%account, constraints = hit.constraints.len(), "acquire denied from admission cache");
            return Ok(Executed::unwritten(AcquireResponse {
                request_id: RequestId::at(self.clock.now()),
                leases: Vec::new(),
                limiting_constraints: hit.constraints.clone(),
                exhausted_constraints: hit.constraints,
                fairness_reduction: 0,
                retry_after: DateTime::from_timestamp_millis(hit.retry_at_ms),
                debug: AcquireDebug {
                    from_admission_cache: true,
                    ..AcquireDebug::default()
                },
            }));
        }

        let target = self.dispatcher.resolve(&req.migration)?;
        let keys = target.prefix.account(account);
        let script_keys = vec![
            keys.idempotency(IdempotencyOp::Acquire, &req.idempotency_key),
            keys.lease_index(),
            self.scavenger_shard_key(target, account),
        ];
        let mut args = acquire_args(&keys, req, &self.config, self.clock.now());

        let mut reply: AcquireReply = self
            .dispatcher
            .eval(target, &scripts::ACQUIRE, &script_keys, &[encode(&args)?])
            .await?;

        let mut blocked = false;
        if let Some(wait_until) = reply.wt {
            blocked = true;
            let wait_ms = wait_until.saturating_sub(self.clock.now_ms()).max(0);
            tracing::debug!(%account, wait_ms, "waiting for capacity within blocking threshold");
            tokio::time::sleep(Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0))).await;
            args.bt = 0;
            reply = self
                .dispatcher
                .eval(target, &scripts::ACQUIRE, &script_keys, &[encode(&args)?])
                .await?;
        }

        let record = reply.r.ok_or_else(|| Error::MalformedResponse {
            script: scripts::ACQUIRE.name().to_string(),
            message: "reply carries no outcome".to_string(),
        })?;

        let response = AcquireResponse {
            request_id: record.rid,
            leases: record
                .l
                .into_inner()
                .into_iter()
                .map(|l| CapacityLease {
                    lease_id: l.id,
                    idempotency_key: l.k,
                })
                .collect(),
            limiting_constraints: record.lc.into_inner(),
            exhausted_constraints: record.ec.into_inner(),
            fairness_reduction: record.fr,
            retry_after: record.ra.and_then(DateTime::from_timestamp_millis),
            debug: AcquireDebug {
                from_admission_cache: false,
                idempotent_replay: reply.ih,
                blocked,
                lines: record.dl.into_inner(),
            },
        };

        if !response.exhausted_constraints.is_empty() {
            self.admission_cache.record_exhausted(
                account,
                req.env_id,
                req.function_id,
                &response.exhausted_constraints,
            );
        }
        self.acquired
            .insert(account, &req.idempotency_key, response.clone());

        self.metrics.record_leases_granted(response.leases.len());
        self.metrics.record_operation(
            "acquire",
            match (reply.ih, response.leases.is_empty()) {
                (true, _) => "replayed",
                (false, true) => "denied",
                (false, false) => "granted",
            },
        );
        tracing::debug!(
            %account,
            granted = response.leases.len(),
            requested = req.amount,
            limiting = response.limiting_constraints.len(),
            "acquire finished"
        );

        Ok(Executed {
            response,
            written_keys: reply.w.into_inner(),
        })
    }

    /// Runs an extension and reports the keys it wrote.
    ///
    /// # Errors
    ///
    /// Returns a user error for invalid requests, an internal error when the
    /// store call fails.
    pub async fn extend_inner(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<Executed<ExtendLeaseResponse>> {
        validate_extend(req)?;
        let account = req.account_id;
        if let Some(cached) = self.extended.get(account, &req.idempotency_key) {
            self.metrics.record_operation("extend", "replayed");
            return Ok(Executed::unwritten(cached));
        }

        let target = self.dispatcher.resolve(&req.migration)?;
        let keys = target.prefix.account(account);
        let script_keys = vec![
            keys.idempotency(IdempotencyOp::Extend, &req.idempotency_key),
            keys.lease_index(),
            self.scavenger_shard_key(target, account),
            keys.lease(&req.lease_id),
        ];
        let args = ExtendArgs {
            a: account,
            id: req.lease_id,
            d: duration_ms(req.duration),
            ittl: Self::record_ttl_ms(self.config.operation_idempotency_ttl()),
            lp: keys.lease_prefix(),
            rsp: keys.request_state_prefix(),
            sp: keys.superseded_prefix(),
        };

        let reply: ExtendReply = self
            .dispatcher
            .eval(target, &scripts::EXTEND, &script_keys, &[encode(&args)?])
            .await?;
        let response = ExtendLeaseResponse {
            lease_id: reply.r.id,
            status: reply.r.st,
        };
        self.extended
            .insert(account, &req.idempotency_key, response.clone());
        self.metrics
            .record_operation("extend", response.status.as_str());

        Ok(Executed {
            response,
            written_keys: reply.w.into_inner(),
        })
    }

    /// Runs a release and reports the keys it wrote.
    ///
    /// # Errors
    ///
    /// Returns a user error for invalid requests, an internal error when the
    /// store call fails.
    pub async fn release_inner(&self, req: &ReleaseRequest) -> Result<Executed<ReleaseResponse>> {
        validate_release(req)?;
        let account = req.account_id;
        if let Some(cached) = self.released.get(account, &req.idempotency_key) {
            self.metrics.record_operation("release", "replayed");
            return Ok(Executed::unwritten(cached));
        }

        let target = self.dispatcher.resolve(&req.migration)?;
        let keys = target.prefix.account(account);
        let script_keys = vec![
            keys.idempotency(IdempotencyOp::Release, &req.idempotency_key),
            keys.lease_index(),
            self.scavenger_shard_key(target, account),
            keys.lease(&req.lease_id),
        ];
        let args = ReleaseArgs {
            a: account,
            id: req.lease_id,
            ittl: Self::record_ttl_ms(self.config.operation_idempotency_ttl()),
            rsp: keys.request_state_prefix(),
        };

        let reply: ReleaseReply = self
            .dispatcher
            .eval(target, &scripts::RELEASE, &script_keys, &[encode(&args)?])
            .await?;
        let response = ReleaseResponse {
            status: reply.r.st,
            account_id: account,
            env_id: reply.r.e,
            function_id: reply.r.f,
            creation_source: reply.r.src,
        };
        self.released
            .insert(account, &req.idempotency_key, response.clone());
        self.metrics
            .record_operation("release", response.status.as_str());

        Ok(Executed {
            response,
            written_keys: reply.w.into_inner(),
        })
    }

    /// Clears a concurrency lease set no constraint resolves to anymore,
    /// typically after a custom key expression changed.
    ///
    /// Lease records and index entries of the removed IDs are left to
    /// release and the scavenger. Returns the number of IDs removed.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `lease_set_key` is not a concurrency
    /// lease set of `account`.
    pub async fn release_orphaned_lease_set(
        &self,
        account: AccountId,
        lease_set_key: &str,
    ) -> Result<Executed<usize>> {
        let target = self.dispatcher.default_target();
        let keys = target.prefix.account(account);
        if !is_lease_set_of(&keys, lease_set_key) {
            return Err(Error::validation(
                "lease_set_key",
                "not a concurrency lease set of this account",
            ));
        }

        let reply: OrphanReply = self
            .dispatcher
            .eval(target, &scripts::RELEASE_ORPHANS, &[lease_set_key.to_string()], &[])
            .await?;
        tracing::info!(%account, key = lease_set_key, removed = reply.n, "released orphaned lease set");
        Ok(Executed {
            response: reply.n,
            written_keys: reply.w.into_inner(),
        })
    }
}

#[async_trait]
impl CapacityManager for StoreCapacityManager {
    async fn check(&self, req: CheckRequest) -> Result<CheckResponse> {
        let _timer = time_operation("check");
        let span = capacity_span("check", &req.account_id.to_string());
        let result = self
            .check_inner(&req)
            .instrument(span)
            .await
            .map(|executed| executed.response);
        if let Err(err) = &result {
            self.metrics.record_operation("check", "error");
            log_error("check", err);
        }
        result
    }

    async fn acquire(&self, req: AcquireRequest) -> Result<AcquireResponse> {
        let _timer = time_operation("acquire");
        let span = capacity_span("acquire", &req.account_id.to_string());
        let result = self.acquire_inner(&req).instrument(span).await;
        finish("acquire", &self.metrics, result)
    }

    async fn extend_lease(&self, req: ExtendLeaseRequest) -> Result<ExtendLeaseResponse> {
        let _timer = time_operation("extend");
        let span = capacity_span("extend", &req.account_id.to_string());
        let result = self.extend_inner(&req).instrument(span).await;
        finish("extend", &self.metrics, result)
    }

    async fn release(&self, req: ReleaseRequest) -> Result<ReleaseResponse> {
        let _timer = time_operation("release");
        let span = capacity_span("release", &req.account_id.to_string());
        let result = self.release_inner(&req).instrument(span).await;
        finish("release", &self.metrics, result)
    }
}

fn finish<T>(
    operation: &'static str,
    metrics: &CapacityMetrics,
    result: Result<Executed<T>>,
) -> Result<T> {
    match result {
        Ok(executed) => Ok(executed.response),
        Err(err) => {
            metrics.record_operation(operation, "error");
            log_error(operation, &err);
            Err(err)
        }
    }
}

fn log_error(operation: &'static str, err: &Error) {
    if err.is_user_error() {
        tracing::debug!(operation, error = %err, "request rejected");
    } else {
        tracing::warn!(operation, error = %err, "capacity operation failed");
    }
}

fn acquire_args(
    keys: &AccountKeys,
    req: &AcquireRequest,
    config: &CapacityConfig,
    now: DateTime<Utc>,
) -> AcquireArgs {
    AcquireArgs {
        a: req.account_id,
        e: req.env_id,
        f: req.function_id,
        c: resolve_constraints(
            keys,
            req.env_id,
            req.function_id,
            &req.configuration,
            &req.constraints,
            config.concurrency_retry_after_ms,
        ),
        n: req.amount,
        lk: req.lease_idempotency_keys.clone(),
        lr: req.lease_run_ids.clone(),
        oik: req.idempotency_key.clone(),
        rid: RequestId::at(now),
        d: duration_ms(req.duration),
        mlt: duration_ms(req.maximum_lifetime),
        bt: req.blocking_threshold.map_or(0, duration_ms),
        ittl: StoreCapacityManager::record_ttl_ms(config.operation_idempotency_ttl()),
        src: req.source,
        lp: keys.lease_prefix(),
        rsp: keys.request_state_prefix(),
    }
}

/// Returns true when `key` names one of the account's concurrency lease sets.
pub(crate) fn is_lease_set_of(keys: &AccountKeys, key: &str) -> bool {
    key.strip_prefix(keys.hash_tag())
        .and_then(|rest| rest.strip_prefix(":concurrency:"))
        .is_some_and(|rest| !rest.is_empty())
}

pub(crate) fn encode<T: serde::Serialize>(args: &T) -> Result<String> {
    serde_json::to_string(args)
        .map_err(|e| Error::internal(format!("encoding script arguments: {e}")))
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
