//! Shared test utilities for capgate integration tests.
//!
//! This crate provides:
//! - [`TestEnv`]: fake clock, in-memory shards, managers and a router
//!   around one account, plus request factories
//! - Lease invariant assertions that read the store directly
//! - [`RecordingHook`]: a lifecycle hook that keeps what it sees
//!
//! # Example
//!
//! ```rust,ignore
//! use capgate_engine::CapacityManager;
//! use capgate_test_utils::TestEnv;
//!
//! #[tokio::test]
//! async fn grants_one_lease() {
//!     let env = TestEnv::builder().account_concurrency(1).build();
//!     let resp = env.manager().acquire(env.acquire("a1", &["l1"])).await.unwrap();
//!     assert_eq!(resp.leases.len(), 1);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod hooks;

pub use assertions::*;
pub use fixtures::*;
pub use hooks::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("capgate=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
