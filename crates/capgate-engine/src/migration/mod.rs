//! Shard migration of one account's constraint state.
//!
//! The coordinator copies in phases while operations keep flowing through
//! the [`MigrationRegistry`]: acquires are blocked from the first phase,
//! extend and release only during the final sync. Keys the source shard
//! receives meanwhile are tracked as dirty and copied again.

mod coordinator;
mod copier;
mod dirty;
mod phase;
mod registry;

pub use coordinator::{MigrationCoordinator, MigrationResult};
pub use copier::{CopyOutcome, DumpRestoreCopier, KeyCopier, TypeAwareCopier};
pub use dirty::DirtyKeyTracker;
pub use phase::MigrationPhase;
pub use registry::{Gate, MigrationRegistry, OperationKind, OperationTicket};
