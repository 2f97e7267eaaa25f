//! Capacity operation requests.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use capgate_core::{
    AccountId, ConstraintConfig, ConstraintItem, EnvId, FunctionId, LeaseId, LeaseSource, RunId,
};
use chrono::{DateTime, Utc};

/// Hint telling the dispatcher which backing-store namespace a request
/// targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MigrationIdentifier {
    /// The request touches the rate-limit namespace.
    pub is_rate_limit: bool,
    /// Named queue-state shard, if any.
    pub queue_shard: Option<String>,
}

impl MigrationIdentifier {
    /// Targets the rate-limit namespace.
    #[must_use]
    pub const fn rate_limit() -> Self {
        Self {
            is_rate_limit: true,
            queue_shard: None,
        }
    }

    /// Targets a named queue-state shard.
    #[must_use]
    pub fn queue_shard(shard: impl Into<String>) -> Self {
        Self {
            is_rate_limit: false,
            queue_shard: Some(shard.into()),
        }
    }
}

impl fmt::Display for MigrationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.queue_shard {
            Some(shard) => f.write_str(shard),
            None if self.is_rate_limit => f.write_str("rate_limit"),
            None => f.write_str("default"),
        }
    }
}

/// Read-only capacity probe.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// Owning account.
    pub account_id: AccountId,
    /// Environment of the function.
    pub env_id: EnvId,
    /// Function being admitted.
    pub function_id: FunctionId,
    /// Latest known configuration.
    pub configuration: ConstraintConfig,
    /// Every constraint the operation is subject to.
    pub constraints: Vec<ConstraintItem>,
    /// Caller clock, compared against server time.
    pub current_time: DateTime<Utc>,
    /// Namespace hint.
    pub migration: MigrationIdentifier,
}

/// Request for up to `amount` leases.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Operation idempotency key.
    pub idempotency_key: String,
    /// Owning account.
    pub account_id: AccountId,
    /// Environment of the function.
    pub env_id: EnvId,
    /// Function being admitted.
    pub function_id: FunctionId,
    /// Latest known configuration.
    pub configuration: ConstraintConfig,
    /// Every constraint the operation is subject to.
    pub constraints: Vec<ConstraintItem>,
    /// Upper bound on leases to grant.
    pub amount: u32,
    /// One key per requested lease, in grant order.
    pub lease_idempotency_keys: Vec<String>,
    /// Run associated with each lease idempotency key, if any.
    pub lease_run_ids: BTreeMap<String, RunId>,
    /// Caller clock, compared against server time.
    pub current_time: DateTime<Utc>,
    /// Lease duration.
    pub duration: Duration,
    /// Cap on the total lifetime of a lease across extensions.
    pub maximum_lifetime: Duration,
    /// Wait up to this long for capacity that is about to free up.
    pub blocking_threshold: Option<Duration>,
    /// Calling service and location.
    pub source: LeaseSource,
    /// Namespace hint.
    pub migration: MigrationIdentifier,
    /// Retry attempt, zero for the first call.
    pub request_attempt: u32,
}

/// Request to extend a lease.
#[derive(Debug, Clone)]
pub struct ExtendLeaseRequest {
    /// Operation idempotency key.
    pub idempotency_key: String,
    /// Owning account.
    pub account_id: AccountId,
    /// Current lease ID.
    pub lease_id: LeaseId,
    /// New duration, counted from server time.
    pub duration: Duration,
    /// Namespace hint.
    pub migration: MigrationIdentifier,
    /// Calling service and location.
    pub source: LeaseSource,
    /// Retry attempt, zero for the first call.
    pub request_attempt: u32,
}

/// Request to release a lease.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    /// Operation idempotency key.
    pub idempotency_key: String,
    /// Owning account.
    pub account_id: AccountId,
    /// Current lease ID.
    pub lease_id: LeaseId,
    /// Namespace hint.
    pub migration: MigrationIdentifier,
    /// Calling service and location.
    pub source: LeaseSource,
    /// Retry attempt, zero for the first call.
    pub request_attempt: u32,
}
