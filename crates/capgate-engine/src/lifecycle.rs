//! Lease lifecycle notifications.

use async_trait::async_trait;
use capgate_core::{AccountId, EnvId, FunctionId, LeaseId, LeaseSource, RunId};

/// A lease the scavenger removed after it expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedLease {
    /// Owning account.
    pub account_id: AccountId,
    /// The expired lease.
    pub lease_id: LeaseId,
    /// Caller's per-lease idempotency key.
    pub lease_idempotency_key: String,
    /// Run the lease was held for, if recorded.
    pub run_id: Option<RunId>,
    /// Environment of the acquire that created the lease.
    pub env_id: Option<EnvId>,
    /// Function of the acquire that created the lease.
    pub function_id: Option<FunctionId>,
    /// Caller that created the lease.
    pub source: Option<LeaseSource>,
}

/// Observer of lease lifecycle events.
///
/// Hooks run inline in the scavenger pass; slow hooks delay reclamation.
#[async_trait]
pub trait LeaseLifecycleHook: Send + Sync {
    /// Called once per reclaimed lease.
    async fn on_reclaimed(&self, lease: &ReclaimedLease);
}
