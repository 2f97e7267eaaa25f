//! Argument and reply shapes exchanged with the scripts.
//!
//! Arguments travel as one JSON document in `ARGV[1]`; fully derived keys
//! travel in `KEYS`. Field names are short because every byte crosses the
//! network on each call. Records (`*Record`) are also what the idempotency
//! layer persists, so a replay returns them verbatim.

use std::collections::BTreeMap;

use capgate_core::{
    AccountId, ConstraintItem, EnvId, FunctionId, LeaseId, LeaseSource, RequestId, RunId,
};
use serde::{Deserialize, Serialize};

use crate::reply::FlexVec;
use crate::resolve::SerializedConstraint;
use crate::response::{ExtendStatus, ReleaseStatus};

/// `KEYS` of acquire: idempotency record, lease index, scavenger shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireArgs {
    /// Owning account.
    pub a: AccountId,
    /// Environment.
    pub e: EnvId,
    /// Function.
    pub f: FunctionId,
    /// Resolved constraints, canonical order.
    pub c: Vec<SerializedConstraint>,
    /// Requested amount.
    pub n: u32,
    /// Per-lease idempotency keys.
    pub lk: Vec<String>,
    /// Run per lease idempotency key.
    #[serde(default)]
    pub lr: BTreeMap<String, RunId>,
    /// Operation idempotency key.
    pub oik: String,
    /// Request ID to stamp on granted leases.
    pub rid: RequestId,
    /// Lease duration in milliseconds.
    pub d: i64,
    /// Maximum lease lifetime in milliseconds.
    pub mlt: i64,
    /// Blocking threshold in milliseconds; zero never waits.
    #[serde(default)]
    pub bt: i64,
    /// Idempotency record TTL in milliseconds; zero skips the record.
    pub ittl: i64,
    /// Caller descriptor.
    pub src: LeaseSource,
    /// Lease record key prefix.
    pub lp: String,
    /// Request state key prefix.
    pub rsp: String,
}

/// A granted lease as recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedLease {
    /// Lease ID.
    pub id: LeaseId,
    /// Lease idempotency key.
    pub k: String,
}

/// Memoized outcome of an acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRecord {
    /// Request ID.
    pub rid: RequestId,
    /// Granted leases.
    #[serde(default)]
    pub l: FlexVec<GrantedLease>,
    /// Limiting constraints.
    #[serde(default)]
    pub lc: FlexVec<ConstraintItem>,
    /// Exhausted constraints.
    #[serde(default)]
    pub ec: FlexVec<ConstraintItem>,
    /// Fairness reduction.
    #[serde(default)]
    pub fr: u32,
    /// Retry time in unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ra: Option<i64>,
    /// Trace lines.
    #[serde(default)]
    pub dl: FlexVec<String>,
}

/// Reply of the acquire script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireReply {
    /// Served from the idempotency record.
    #[serde(default)]
    pub ih: bool,
    /// Capacity frees up within the blocking threshold at this time
    /// (unix milliseconds); nothing was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wt: Option<i64>,
    /// The outcome, absent when waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<AcquireRecord>,
    /// Keys written.
    #[serde(default)]
    pub w: FlexVec<String>,
}

/// `KEYS` of check: idempotency record (may be empty when disabled).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckArgs {
    /// Resolved constraints, canonical order.
    pub c: Vec<SerializedConstraint>,
    /// Idempotency record TTL in milliseconds; zero disables it.
    pub ittl: i64,
}

/// Usage of one constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// The constraint.
    pub c: ConstraintItem,
    /// Used.
    pub u: i64,
    /// Limit.
    pub l: i64,
}

/// Memoized outcome of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRecord {
    /// Available capacity.
    pub ac: i64,
    /// Limiting constraints.
    #[serde(default)]
    pub lc: FlexVec<ConstraintItem>,
    /// Usage per constraint.
    #[serde(default)]
    pub u: FlexVec<UsageRecord>,
    /// Fairness reduction.
    #[serde(default)]
    pub fr: u32,
    /// Retry time in unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ra: Option<i64>,
}

/// Reply of the check script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReply {
    /// Served from the idempotency record.
    #[serde(default)]
    pub ih: bool,
    /// The outcome.
    pub r: CheckRecord,
    /// Keys written.
    #[serde(default)]
    pub w: FlexVec<String>,
}

/// `KEYS` of extend: idempotency record, lease index, scavenger shard,
/// current lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendArgs {
    /// Owning account.
    pub a: AccountId,
    /// Current lease ID.
    pub id: LeaseId,
    /// New duration in milliseconds.
    pub d: i64,
    /// Idempotency record TTL in milliseconds.
    pub ittl: i64,
    /// Lease record key prefix.
    pub lp: String,
    /// Request state key prefix.
    pub rsp: String,
    /// Supersession marker prefix.
    pub sp: String,
}

/// Memoized outcome of an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendRecord {
    /// Outcome.
    pub st: ExtendStatus,
    /// New lease ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LeaseId>,
}

/// Reply of the extend script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendReply {
    /// Served from the idempotency record.
    #[serde(default)]
    pub ih: bool,
    /// The outcome.
    pub r: ExtendRecord,
    /// Keys written.
    #[serde(default)]
    pub w: FlexVec<String>,
}

/// `KEYS` of release: idempotency record, lease index, scavenger shard,
/// lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseArgs {
    /// Owning account.
    pub a: AccountId,
    /// Lease ID.
    pub id: LeaseId,
    /// Idempotency record TTL in milliseconds.
    pub ittl: i64,
    /// Request state key prefix.
    pub rsp: String,
}

/// Memoized outcome of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    /// Outcome.
    pub st: ReleaseStatus,
    /// Environment of the released lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<EnvId>,
    /// Function of the released lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f: Option<FunctionId>,
    /// Source that created the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<LeaseSource>,
}

/// Reply of the release script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReply {
    /// Served from the idempotency record.
    #[serde(default)]
    pub ih: bool,
    /// The outcome.
    pub r: ReleaseRecord,
    /// Keys written.
    #[serde(default)]
    pub w: FlexVec<String>,
}

/// `KEYS` of reclaim: lease index, scavenger shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimArgs {
    /// Owning account.
    pub a: AccountId,
    /// Lease record key prefix.
    pub lp: String,
    /// Request state key prefix.
    pub rsp: String,
    /// Maximum leases reclaimed per call.
    pub max: usize,
}

/// A lease removed by the scavenger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimedRecord {
    /// Lease ID.
    pub id: LeaseId,
    /// Lease idempotency key.
    #[serde(default)]
    pub k: String,
    /// Run the lease was held for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunId>,
    /// Environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<EnvId>,
    /// Function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f: Option<FunctionId>,
    /// Source that created the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<LeaseSource>,
}

/// Reply of the reclaim script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimReply {
    /// Expired leases found before reclaiming.
    #[serde(default)]
    pub te: usize,
    /// Reclaimed leases.
    #[serde(default)]
    pub l: FlexVec<ReclaimedRecord>,
    /// Keys written.
    #[serde(default)]
    pub w: FlexVec<String>,
}

/// `KEYS` of the scavenger peek: scavenger shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekArgs {
    /// Maximum accounts returned.
    pub max: usize,
}

/// An account due for reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekedAccount {
    /// Account ID.
    pub a: String,
    /// Earliest lease expiry, unix milliseconds.
    pub s: i64,
}

/// Reply of the scavenger peek.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekReply {
    /// Accounts with expired leases, earliest first.
    #[serde(default)]
    pub a: FlexVec<PeekedAccount>,
    /// Accounts with expired leases in the shard.
    #[serde(default)]
    pub te: usize,
    /// Accounts in the shard.
    #[serde(default)]
    pub t: usize,
}

/// Reply of the orphaned lease-set release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanReply {
    /// Lease IDs removed from the set.
    #[serde(default)]
    pub n: usize,
    /// Keys written.
    #[serde(default)]
    pub w: FlexVec<String>,
}
