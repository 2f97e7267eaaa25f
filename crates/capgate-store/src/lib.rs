//! # capgate-store
//!
//! The backing store the admission engine runs against: named shards of
//! strings, hashes and sorted sets with millisecond TTLs, cursor scans,
//! dump/restore and atomic server-side scripts.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use capgate_core::{FakeClock, SharedClock};
//! use capgate_store::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let clock: SharedClock = FakeClock::shared(chrono::Utc::now());
//! let store = MemoryStore::new("shard-0", clock);
//! store.set("{p:a}:k", b"v".to_vec(), Some(1_000)).await.unwrap();
//! assert_eq!(store.pttl("{p:a}:k").await.unwrap(), 1_000);
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod keyspace;
pub mod memory;
pub mod script;
pub mod shards;
pub mod value;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backend::KeyValueStore;
    pub use crate::error::{Error as StoreError, Result as StoreResult};
    pub use crate::memory::MemoryStore;
    pub use crate::script::{Script, ScriptContext, ScriptFn};
    pub use crate::shards::Shards;
    pub use crate::value::KeyType;
}

pub use backend::KeyValueStore;
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use script::{Script, ScriptContext, ScriptFn, encode_reply};
pub use shards::Shards;
pub use value::{KeyType, SortedSet, Value};
