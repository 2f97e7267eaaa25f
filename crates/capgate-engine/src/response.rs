//! Capacity operation responses.
//!
//! Admission outcomes are reported in-band: a denied acquire is a response
//! with no leases, not an error.

use capgate_core::{AccountId, ConstraintItem, EnvId, FunctionId, LeaseId, LeaseSource, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A granted lease and the resource it was granted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLease {
    /// Lease ID; its timestamp is the lease expiry.
    pub lease_id: LeaseId,
    /// The per-lease idempotency key supplied by the caller.
    pub idempotency_key: String,
}

/// How an acquire response was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireDebug {
    /// Served by the admission cache without a store call.
    pub from_admission_cache: bool,
    /// Replayed from an idempotency record.
    pub idempotent_replay: bool,
    /// The request waited for capacity before its final attempt.
    pub blocked: bool,
    /// Script trace lines.
    pub lines: Vec<String>,
}

/// Result of an acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireResponse {
    /// Server-side request ID.
    pub request_id: RequestId,
    /// Between zero and `amount` leases, in caller key order.
    pub leases: Vec<CapacityLease>,
    /// Constraints that reduced the grant below the requested amount.
    pub limiting_constraints: Vec<ConstraintItem>,
    /// The most specific constraint left with no capacity, if any.
    pub exhausted_constraints: Vec<ConstraintItem>,
    /// Capacity held back for fairness.
    pub fairness_reduction: u32,
    /// Earliest time a retry can be granted more capacity.
    pub retry_after: Option<DateTime<Utc>>,
    /// Diagnostics.
    pub debug: AcquireDebug,
}

/// Usage of one constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintUsage {
    /// The constraint.
    pub constraint: ConstraintItem,
    /// Capacity in use.
    pub used: u32,
    /// Configured ceiling.
    pub limit: u32,
}

/// Result of a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    /// Minimum free capacity over all constraints.
    pub available_capacity: u32,
    /// Constraints with no free capacity.
    pub limiting_constraints: Vec<ConstraintItem>,
    /// Per-constraint usage, in canonical constraint order.
    pub usage: Vec<ConstraintUsage>,
    /// Capacity held back for fairness.
    pub fairness_reduction: u32,
    /// Earliest time a limiting constraint frees capacity.
    pub retry_after: Option<DateTime<Utc>>,
    /// Replayed from a check record.
    pub idempotent_replay: bool,
}

/// Outcome of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendStatus {
    /// The lease was replaced by a new ID.
    Extended,
    /// No record of the lease remains.
    AlreadyCleanedUp,
    /// The lease was already replaced by an earlier extension.
    Superseded,
    /// The lease expired before the extension arrived.
    Expired,
    /// The extension would outlive the lease's maximum lifetime.
    LifetimeExceeded,
}

impl ExtendStatus {
    /// Metric label of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Extended => "extended",
            Self::AlreadyCleanedUp => "already_cleaned_up",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
            Self::LifetimeExceeded => "lifetime_exceeded",
        }
    }
}

/// Result of an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendLeaseResponse {
    /// The new lease ID; `None` unless the lease was extended.
    pub lease_id: Option<LeaseId>,
    /// Outcome.
    pub status: ExtendStatus,
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// The lease was released.
    Released,
    /// No record of the lease remains.
    AlreadyCleanedUp,
}

impl ReleaseStatus {
    /// Metric label of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::AlreadyCleanedUp => "already_cleaned_up",
        }
    }
}

/// Result of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseResponse {
    /// Outcome.
    pub status: ReleaseStatus,
    /// Owning account.
    pub account_id: AccountId,
    /// Environment the lease was acquired for.
    pub env_id: Option<EnvId>,
    /// Function the lease was acquired for.
    pub function_id: Option<FunctionId>,
    /// Where the lease was created.
    pub creation_source: Option<LeaseSource>,
}
