//! Resolution of submitted constraints into script arguments.
//!
//! Scripts never see [`ConstraintConfig`]: each constraint is resolved
//! against it up front into a [`SerializedConstraint`] carrying the ceiling,
//! the GCRA parameters and the fully derived state keys. Constraints are
//! emitted in canonical order.

use capgate_core::constraint::{
    ConcurrencyConstraint, ConcurrencyMode, RateLimitConstraint, ThrottleConstraint,
};
use capgate_core::{AccountKeys, ConstraintConfig, ConstraintItem, EnvId, FunctionId, Scope};
use serde::{Deserialize, Serialize};

use crate::gcra::{GcraParams, Resolution};

const MS_PER_SEC: i64 = 1_000;
const NS_PER_SEC: i64 = 1_000_000_000;

/// A concurrency constraint with its ceiling and lease-set key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedConcurrency {
    /// Step or run mode.
    #[serde(rename = "m")]
    pub mode: ConcurrencyMode,
    /// Scope.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Key expression hash.
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    /// Evaluated key hash.
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
    /// Resolved ceiling.
    #[serde(rename = "l")]
    pub limit: i64,
    /// Caller-owned in-flight item set.
    #[serde(rename = "iik", default, skip_serializing_if = "String::is_empty")]
    pub in_progress_item_key: String,
    /// Lease set key.
    #[serde(rename = "ilk")]
    pub in_progress_leases_key: String,
    /// Retry hint in milliseconds when the ceiling is reached.
    #[serde(rename = "ra")]
    pub retry_after_ms: i64,
}

/// A throttle or rate limit with its GCRA parameters and TAT key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedGcra {
    /// Scope.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Key expression hash.
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    /// Evaluated key hash.
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
    /// Units per period.
    #[serde(rename = "l")]
    pub limit: i64,
    /// Burst allowance.
    #[serde(rename = "b")]
    pub burst: i64,
    /// Period in the key's resolution.
    #[serde(rename = "p")]
    pub period: i64,
    /// TAT key.
    #[serde(rename = "k")]
    pub key: String,
}

impl SerializedGcra {
    /// GCRA parameters of this constraint.
    #[must_use]
    pub const fn params(&self) -> GcraParams {
        GcraParams {
            limit: self.limit,
            burst: self.burst,
            period: self.period,
        }
    }
}

/// A constraint resolved for script execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializedConstraint {
    /// Rate limit, nanosecond resolution.
    #[serde(rename = "r")]
    RateLimit(SerializedGcra),
    /// Throttle, millisecond resolution.
    #[serde(rename = "t")]
    Throttle(SerializedGcra),
    /// Concurrency ceiling.
    #[serde(rename = "c")]
    Concurrency(SerializedConcurrency),
}

impl SerializedConstraint {
    /// Rebuilds the constraint as the caller submitted it.
    #[must_use]
    pub fn item(&self) -> ConstraintItem {
        match self {
            Self::Concurrency(c) => ConstraintItem::Concurrency(ConcurrencyConstraint {
                mode: c.mode,
                scope: c.scope,
                key_expression_hash: c.key_expression_hash.clone(),
                evaluated_key_hash: c.evaluated_key_hash.clone(),
                in_progress_item_key: c.in_progress_item_key.clone(),
            }),
            Self::Throttle(t) => ConstraintItem::Throttle(ThrottleConstraint {
                scope: t.scope,
                key_expression_hash: t.key_expression_hash.clone(),
                evaluated_key_hash: t.evaluated_key_hash.clone(),
            }),
            Self::RateLimit(r) => ConstraintItem::RateLimit(RateLimitConstraint {
                scope: r.scope,
                key_expression_hash: r.key_expression_hash.clone(),
                evaluated_key_hash: r.evaluated_key_hash.clone(),
            }),
        }
    }

    /// The GCRA half of the constraint, with its resolution.
    #[must_use]
    pub const fn gcra(&self) -> Option<(&SerializedGcra, Resolution)> {
        match self {
            Self::Throttle(t) => Some((t, Resolution::Millis)),
            Self::RateLimit(r) => Some((r, Resolution::Nanos)),
            Self::Concurrency(_) => None,
        }
    }

    /// Lease set key, for concurrency constraints.
    #[must_use]
    pub fn lease_set_key(&self) -> Option<&str> {
        match self {
            Self::Concurrency(c) => Some(&c.in_progress_leases_key),
            Self::Throttle(_) | Self::RateLimit(_) => None,
        }
    }
}

/// Resolves `constraints` against `config`, in canonical order.
#[must_use]
pub fn resolve_constraints(
    keys: &AccountKeys,
    env: EnvId,
    function: FunctionId,
    config: &ConstraintConfig,
    constraints: &[ConstraintItem],
    concurrency_retry_after_ms: u64,
) -> Vec<SerializedConstraint> {
    let mut sorted: Vec<&ConstraintItem> = constraints.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .map(|item| match item {
            ConstraintItem::Concurrency(c) => {
                SerializedConstraint::Concurrency(SerializedConcurrency {
                    mode: c.mode,
                    scope: c.scope,
                    key_expression_hash: c.key_expression_hash.clone(),
                    evaluated_key_hash: c.evaluated_key_hash.clone(),
                    limit: i64::from(config.concurrency_limit(c)),
                    in_progress_item_key: c.in_progress_item_key.clone(),
                    in_progress_leases_key: keys.concurrency(c, env, function),
                    retry_after_ms: i64::try_from(concurrency_retry_after_ms)
                        .unwrap_or(i64::MAX),
                })
            }
            ConstraintItem::Throttle(t) => {
                let (limit, burst, period_secs) = config
                    .throttle_for(t)
                    .map_or((0, 0, 0), |cfg| (cfg.limit, cfg.burst, cfg.period_secs));
                SerializedConstraint::Throttle(SerializedGcra {
                    scope: t.scope,
                    key_expression_hash: t.key_expression_hash.clone(),
                    evaluated_key_hash: t.evaluated_key_hash.clone(),
                    limit: i64::from(limit),
                    burst: i64::from(burst),
                    period: i64::from(period_secs) * MS_PER_SEC,
                    key: keys.throttle(t, env),
                })
            }
            ConstraintItem::RateLimit(r) => {
                let (limit, burst, period_secs) = config
                    .rate_limit_for(r)
                    .map_or((0, 0, 0), |cfg| (cfg.limit, cfg.burst(), cfg.period_secs));
                SerializedConstraint::RateLimit(SerializedGcra {
                    scope: r.scope,
                    key_expression_hash: r.key_expression_hash.clone(),
                    evaluated_key_hash: r.evaluated_key_hash.clone(),
                    limit: i64::from(limit),
                    burst: i64::from(burst),
                    period: i64::from(period_secs) * NS_PER_SEC,
                    key: keys.rate_limit(r, env),
                })
            }
        })
        .collect()
}
