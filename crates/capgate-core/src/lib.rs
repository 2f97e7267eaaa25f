//! # capgate-core
//!
//! Shared primitives for the capgate admission-control service.
//!
//! - **Identifiers**: tenancy UUIDs and time-sortable lease/request IDs
//! - **Constraint model**: concurrency, throttle and rate-limit constraints,
//!   their canonical order and compact wire form
//! - **Key derivation**: hash-tagged backing-store keys per account
//! - **Configuration**: service settings and fixed request budgets
//! - **Clock**: injectable wall clock for deterministic tests
//!
//! ## Example
//!
//! ```rust
//! use capgate_core::prelude::*;
//!
//! let account = AccountId::generate();
//! let keys = KeyPrefix::new("capgate").account(account);
//! assert!(keys.lease_index().ends_with(":leaseq"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod config;
pub mod constraint;
pub mod constraint_config;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod keys;
pub mod lease_source;
pub mod limits;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, FakeClock, SharedClock, SystemClock};
    pub use crate::config::CapacityConfig;
    pub use crate::constraint::{
        ConcurrencyConstraint, ConcurrencyMode, ConstraintItem, ConstraintKind,
        RateLimitConstraint, Scope, ThrottleConstraint,
    };
    pub use crate::constraint_config::{
        ConcurrencyConfig, ConstraintConfig, CustomConcurrencyLimit, RateLimitConfig,
        ThrottleConfig,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::{AccountId, EnvId, FunctionId, LeaseId, RequestId, RunId};
    pub use crate::keys::{AccountKeys, IdempotencyOp, KeyPrefix};
    pub use crate::lease_source::{CallerLocation, LeaseService, LeaseSource, RunProcessingMode};
}

pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use config::{AdmissionCacheConfig, CapacityConfig, MigrationConfig, ScavengerConfig};
pub use constraint::{ConstraintItem, ConstraintKind, Scope, sort_constraints};
pub use constraint_config::ConstraintConfig;
pub use error::{Error, Result};
pub use fingerprint::{admission_cache_key, constraint_fingerprint};
pub use id::{AccountId, EnvId, FunctionId, LeaseId, RequestId, RunId};
pub use keys::{AccountKeys, IdempotencyOp, KeyPrefix, scavenger_shard_index};
pub use lease_source::LeaseSource;
pub use observability::{LogFormat, init_logging};
