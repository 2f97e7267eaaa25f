//! # capgate-engine
//!
//! The admission engine: grants, extends and releases capacity leases
//! against concurrency, throttle and rate-limit constraints.
//!
//! ## Architecture
//!
//! ```text
//! RoutingCapacityManager ─► MigrationRegistry (gate) ─► ShardRouter
//!                                                          │
//!                                         StoreCapacityManager (per shard)
//!                                          │ validation, idempotency,
//!                                          │ admission cache, duplicates
//!                                          ▼
//!                                      Dispatcher ─► scripts (atomic per account)
//! ```
//!
//! - **Scripts**: every operation is one atomic script on the account's shard
//! - **Scavenger**: reclaims expired leases shard by shard
//! - **Migration**: moves an account between shards with a bounded pause
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use capgate_core::{CapacityConfig, FakeClock, KeyPrefix, SharedClock};
//! use capgate_engine::prelude::*;
//! use capgate_store::MemoryStore;
//!
//! let clock: SharedClock = FakeClock::shared(chrono::Utc::now());
//! let store = Arc::new(MemoryStore::new("shard-0", clock.clone()));
//! let dispatcher = Dispatcher::new(DispatchTarget::new(store, KeyPrefix::new("capgate")));
//! let manager = StoreCapacityManager::new(Arc::new(CapacityConfig::default()), clock, dispatcher);
//! assert_eq!(manager.config().key_prefix, "capgate");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admission_cache;
pub mod dispatch;
pub mod duplicate_tracker;
pub mod error;
pub mod gcra;
pub mod idempotency;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod migration;
pub mod reply;
pub mod request;
pub mod resolve;
pub mod response;
pub mod routing;
pub mod scavenger;
pub mod scripts;
pub mod validation;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::admission_cache::{
        AdmissionCache, AdmissionCacheEnable, CacheWindow, DefaultShouldCache, ShouldCache,
    };
    pub use crate::dispatch::{DispatchTarget, Dispatcher};
    pub use crate::duplicate_tracker::{DuplicateReporter, DuplicateTracker};
    pub use crate::error::{Error, ErrorChannel, Result};
    pub use crate::lifecycle::{LeaseLifecycleHook, ReclaimedLease};
    pub use crate::manager::{CapacityManager, Executed, StoreCapacityManager};
    pub use crate::migration::{
        DumpRestoreCopier, KeyCopier, MigrationCoordinator, MigrationPhase, MigrationRegistry,
        MigrationResult, TypeAwareCopier,
    };
    pub use crate::request::{
        AcquireRequest, CheckRequest, ExtendLeaseRequest, MigrationIdentifier, ReleaseRequest,
    };
    pub use crate::response::{
        AcquireDebug, AcquireResponse, CapacityLease, CheckResponse, ConstraintUsage,
        ExtendLeaseResponse, ExtendStatus, ReleaseResponse, ReleaseStatus,
    };
    pub use crate::routing::{RoutingCapacityManager, ShardRouter};
    pub use crate::scavenger::{ScavengeResult, Scavenger, ScavengerService};
}

pub use error::{Error, ErrorChannel, Result};
pub use manager::{CapacityManager, Executed, StoreCapacityManager};
pub use request::{AcquireRequest, CheckRequest, ExtendLeaseRequest, MigrationIdentifier, ReleaseRequest};
pub use response::{
    AcquireResponse, CheckResponse, ExtendLeaseResponse, ExtendStatus, ReleaseResponse,
    ReleaseStatus,
};
pub use routing::{RoutingCapacityManager, ShardRouter};
pub use scavenger::{ScavengeResult, Scavenger, ScavengerService};
