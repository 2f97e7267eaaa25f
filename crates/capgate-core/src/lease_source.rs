//! Who asked for a lease, and from where.
//!
//! Source descriptors ride along with acquire requests, are stored with the
//! request state and come back on release. They only feed observability.

use serde::{Deserialize, Serialize};

/// The service that requested capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseService {
    /// Not reported.
    #[default]
    Unknown,
    /// The new-runs scheduler.
    NewRuns,
    /// The step executor.
    Executor,
    /// The public API.
    Api,
    /// The lease scavenger itself.
    ConstraintScavenger,
}

/// The code path inside the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerLocation {
    /// Not reported.
    #[default]
    Unknown,
    /// Scheduling a new run.
    Schedule,
    /// Refilling a backlog.
    BacklogRefill,
    /// Leasing a queue item.
    ItemLease,
    /// Checkpointing a durable endpoint.
    Checkpoint,
    /// Reclaiming expired leases.
    LeaseScavenge,
}

/// How the run is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunProcessingMode {
    /// Background queue processing.
    #[default]
    Background,
    /// Synchronous durable endpoint.
    DurableEndpoint,
}

/// Descriptor of the caller that created a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LeaseSource {
    /// Requesting service.
    #[serde(rename = "s", default)]
    pub service: LeaseService,
    /// Code path within the service.
    #[serde(rename = "l", default)]
    pub location: CallerLocation,
    /// Processing mode.
    #[serde(rename = "m", default)]
    pub run_processing_mode: RunProcessingMode,
}

impl LeaseSource {
    /// Creates a source descriptor for background processing.
    #[must_use]
    pub const fn new(service: LeaseService, location: CallerLocation) -> Self {
        Self {
            service,
            location,
            run_processing_mode: RunProcessingMode::Background,
        }
    }
}
