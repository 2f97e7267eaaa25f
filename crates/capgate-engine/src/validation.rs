//! Request validation.
//!
//! Every check here fails on the user channel. Validation runs before any
//! store call so a rejected request never consumes capacity or writes an
//! idempotency record.

use std::time::Duration;

use capgate_core::limits::{
    MAX_ACQUIRE_AMOUNT, MAX_IDEMPOTENCY_KEY_LEN, MAX_LEASE_DURATION, MAX_RATE_LIMITS_PER_REQUEST,
    MAX_THROTTLES_PER_REQUEST, MIN_LEASE_DURATION,
};
use capgate_core::{AccountId, ConstraintConfig, ConstraintItem, ConstraintKind, EnvId, FunctionId};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::request::{AcquireRequest, CheckRequest, ExtendLeaseRequest, ReleaseRequest};

/// Validates an acquire request.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first offending field.
pub fn validate_acquire(req: &AcquireRequest) -> Result<()> {
    idempotency_key("idempotency_key", &req.idempotency_key)?;
    identity(req.account_id, req.env_id, req.function_id)?;
    caller_time(req.current_time)?;
    configuration(&req.configuration)?;
    constraints(&req.constraints)?;

    if req.amount == 0 || req.amount > MAX_ACQUIRE_AMOUNT {
        return Err(Error::validation(
            "amount",
            format!("must be between 1 and {MAX_ACQUIRE_AMOUNT}, got {}", req.amount),
        ));
    }
    if req.lease_idempotency_keys.len() != req.amount as usize {
        return Err(Error::validation(
            "lease_idempotency_keys",
            format!(
                "expected {} keys, got {}",
                req.amount,
                req.lease_idempotency_keys.len()
            ),
        ));
    }
    for key in &req.lease_idempotency_keys {
        idempotency_key("lease_idempotency_keys", key)?;
    }

    lease_duration("duration", req.duration)?;
    if req.maximum_lifetime < req.duration {
        return Err(Error::validation(
            "maximum_lifetime",
            "must not be shorter than duration",
        ));
    }
    Ok(())
}

/// Validates a check request.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first offending field.
pub fn validate_check(req: &CheckRequest) -> Result<()> {
    identity(req.account_id, req.env_id, req.function_id)?;
    caller_time(req.current_time)?;
    configuration(&req.configuration)?;
    constraints(&req.constraints)
}

/// Validates an extend request.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first offending field.
pub fn validate_extend(req: &ExtendLeaseRequest) -> Result<()> {
    idempotency_key("idempotency_key", &req.idempotency_key)?;
    account(req.account_id)?;
    lease_duration("duration", req.duration)
}

/// Validates a release request.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first offending field.
pub fn validate_release(req: &ReleaseRequest) -> Result<()> {
    idempotency_key("idempotency_key", &req.idempotency_key)?;
    account(req.account_id)
}

/// Rejects callers whose clock drifts too far from server time.
///
/// Skew strictly above the threshold is always rejected. Skew equal to the
/// threshold is rejected only when `reject_at_threshold` is set.
///
/// # Errors
///
/// Returns [`Error::ClockSkew`] when the request must be rejected.
pub fn check_clock_skew(
    caller: DateTime<Utc>,
    server: DateTime<Utc>,
    threshold_ms: u64,
    reject_at_threshold: bool,
) -> Result<()> {
    let skew_ms = (server - caller).num_milliseconds().saturating_abs();
    let threshold = i64::try_from(threshold_ms).unwrap_or(i64::MAX);
    let rejected = skew_ms > threshold || (reject_at_threshold && skew_ms == threshold);
    if rejected {
        return Err(Error::ClockSkew {
            skew_ms,
            threshold_ms,
        });
    }
    Ok(())
}

fn idempotency_key(field: &'static str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(Error::validation(
            field,
            format!("must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"),
        ));
    }
    Ok(())
}

fn account(account_id: AccountId) -> Result<()> {
    if account_id.is_nil() {
        return Err(Error::validation("account_id", "must be set"));
    }
    Ok(())
}

fn identity(account_id: AccountId, env_id: EnvId, function_id: FunctionId) -> Result<()> {
    account(account_id)?;
    if env_id.is_nil() {
        return Err(Error::validation("env_id", "must be set"));
    }
    if function_id.is_nil() {
        return Err(Error::validation("function_id", "must be set"));
    }
    Ok(())
}

fn caller_time(current_time: DateTime<Utc>) -> Result<()> {
    if current_time.timestamp_millis() <= 0 {
        return Err(Error::validation("current_time", "must be set"));
    }
    Ok(())
}

fn configuration(config: &ConstraintConfig) -> Result<()> {
    if config.function_version == 0 {
        return Err(Error::validation(
            "configuration",
            "function version must be greater than zero",
        ));
    }
    Ok(())
}

fn constraints(items: &[ConstraintItem]) -> Result<()> {
    if items.is_empty() {
        return Err(Error::validation("constraints", "must not be empty"));
    }
    let count = |kind| items.iter().filter(|c| c.kind() == kind).count();
    if count(ConstraintKind::RateLimit) > MAX_RATE_LIMITS_PER_REQUEST {
        return Err(Error::validation(
            "constraints",
            format!("at most {MAX_RATE_LIMITS_PER_REQUEST} rate limit per request"),
        ));
    }
    if count(ConstraintKind::Throttle) > MAX_THROTTLES_PER_REQUEST {
        return Err(Error::validation(
            "constraints",
            format!("at most {MAX_THROTTLES_PER_REQUEST} throttle per request"),
        ));
    }
    Ok(())
}

fn lease_duration(field: &'static str, duration: Duration) -> Result<()> {
    if duration < MIN_LEASE_DURATION || duration > MAX_LEASE_DURATION {
        return Err(Error::validation(
            field,
            format!(
                "must be between {}s and {}s",
                MIN_LEASE_DURATION.as_secs(),
                MAX_LEASE_DURATION.as_secs()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use capgate_core::constraint::ConcurrencyMode;
    use capgate_core::{LeaseSource, Scope};
    use chrono::TimeZone;

    use super::*;
    use crate::request::MigrationIdentifier;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn acquire() -> AcquireRequest {
        AcquireRequest {
            idempotency_key: "op".into(),
            account_id: AccountId::generate(),
            env_id: EnvId::generate(),
            function_id: FunctionId::generate(),
            configuration: ConstraintConfig {
                function_version: 1,
                ..ConstraintConfig::default()
            },
            constraints: vec![ConstraintItem::concurrency(
                ConcurrencyMode::Step,
                Scope::Account,
            )],
            amount: 2,
            lease_idempotency_keys: vec!["l1".into(), "l2".into()],
            lease_run_ids: BTreeMap::new(),
            current_time: now(),
            duration: Duration::from_secs(5),
            maximum_lifetime: Duration::from_secs(60),
            blocking_threshold: None,
            source: LeaseSource::default(),
            migration: MigrationIdentifier::default(),
            request_attempt: 0,
        }
    }

    fn field(err: Error) -> &'static str {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected a validation error, got {other}"),
        }
    }

    #[test]
    fn valid_acquire_passes() {
        assert!(validate_acquire(&acquire()).is_ok());
    }

    #[test]
    fn amount_above_budget_is_rejected() {
        let mut req = acquire();
        req.amount = 21;
        req.lease_idempotency_keys = (0..21).map(|i| format!("l{i}")).collect();
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "amount");
    }

    #[test]
    fn lease_keys_must_match_amount() {
        let mut req = acquire();
        req.lease_idempotency_keys.pop();
        assert_eq!(
            field(validate_acquire(&req).unwrap_err()),
            "lease_idempotency_keys"
        );
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let mut req = acquire();
        req.idempotency_key = "k".repeat(129);
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "idempotency_key");

        let mut req = acquire();
        req.idempotency_key = "k".repeat(128);
        assert!(validate_acquire(&req).is_ok());
    }

    #[test]
    fn duration_bounds_are_inclusive() {
        let mut req = acquire();
        req.duration = Duration::from_secs(2);
        assert!(validate_acquire(&req).is_ok());
        req.duration = Duration::from_secs(60);
        assert!(validate_acquire(&req).is_ok());
        req.duration = Duration::from_millis(1_999);
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "duration");
        req.duration = Duration::from_millis(60_001);
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "duration");
    }

    #[test]
    fn maximum_lifetime_must_cover_duration() {
        let mut req = acquire();
        req.maximum_lifetime = Duration::from_secs(4);
        assert_eq!(
            field(validate_acquire(&req).unwrap_err()),
            "maximum_lifetime"
        );
    }

    #[test]
    fn at_most_one_throttle_and_rate_limit() {
        let mut req = acquire();
        req.constraints = vec![
            ConstraintItem::throttle(Scope::Function, "a", "1"),
            ConstraintItem::throttle(Scope::Function, "b", "2"),
        ];
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "constraints");

        req.constraints = vec![
            ConstraintItem::rate_limit(Scope::Function, "a", "1"),
            ConstraintItem::rate_limit(Scope::Account, "b", "2"),
        ];
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "constraints");

        req.constraints = vec![
            ConstraintItem::rate_limit(Scope::Function, "a", "1"),
            ConstraintItem::throttle(Scope::Function, "b", "2"),
        ];
        assert!(validate_acquire(&req).is_ok());
    }

    #[test]
    fn missing_version_and_constraints_are_rejected() {
        let mut req = acquire();
        req.configuration.function_version = 0;
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "configuration");

        let mut req = acquire();
        req.constraints.clear();
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "constraints");
    }

    #[test]
    fn nil_ids_are_rejected() {
        let mut req = acquire();
        req.env_id = EnvId::from_uuid(uuid::Uuid::nil());
        assert_eq!(field(validate_acquire(&req).unwrap_err()), "env_id");
    }

    #[test]
    fn clock_skew_threshold_policy() {
        let server = now();
        let at = |ms| server + chrono::Duration::milliseconds(ms);

        assert!(check_clock_skew(at(4_999), server, 5_000, true).is_ok());
        assert!(check_clock_skew(at(5_000), server, 5_000, false).is_ok());
        assert!(check_clock_skew(at(5_000), server, 5_000, true).is_err());
        assert!(check_clock_skew(at(-5_001), server, 5_000, false).is_err());

        let err = check_clock_skew(at(6_000), server, 5_000, false).unwrap_err();
        assert!(err.is_user_error());
    }
}
