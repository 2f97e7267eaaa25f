//! Migration phases.

use std::fmt;

/// Where a migration of one account stands.
///
/// ```text
/// Idle ─► CopyingGcra ─► CopyingLeaseState ─► ConvergingDelta ─► FinalSync ─► SwitchingRoute ─► Cleanup ─► Complete
///              │                 │                   │               │              │
///              └─────────────────┴───────────────────┴───────────────┴──────────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MigrationPhase {
    /// No migration.
    #[default]
    Idle,
    /// Copying throttle and rate-limit state; acquires are blocked.
    CopyingGcra,
    /// Copying leases, lease sets and idempotency records.
    CopyingLeaseState,
    /// Re-copying keys written during the copy.
    ConvergingDelta,
    /// Extend and release are paused while the last dirty keys are copied.
    FinalSync,
    /// The routing table is being switched to the destination.
    SwitchingRoute,
    /// Source keys are being removed.
    Cleanup,
    /// The destination is authoritative.
    Complete,
    /// The migration aborted; the source stays authoritative.
    Failed,
}

impl MigrationPhase {
    /// Returns the phase name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CopyingGcra => "copying_gcra",
            Self::CopyingLeaseState => "copying_lease_state",
            Self::ConvergingDelta => "converging_delta",
            Self::FinalSync => "final_sync",
            Self::SwitchingRoute => "switching_route",
            Self::Cleanup => "cleanup",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Returns true while the source shard must not grant new leases.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::CopyingGcra
                | Self::CopyingLeaseState
                | Self::ConvergingDelta
                | Self::FinalSync
                | Self::SwitchingRoute
        )
    }

    /// Returns true while every operation on the account is paused.
    #[must_use]
    pub const fn is_paused(self) -> bool {
        matches!(self, Self::FinalSync | Self::SwitchingRoute)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_final_phases_pause_everything() {
        let paused: Vec<_> = [
            MigrationPhase::Idle,
            MigrationPhase::CopyingGcra,
            MigrationPhase::CopyingLeaseState,
            MigrationPhase::ConvergingDelta,
            MigrationPhase::FinalSync,
            MigrationPhase::SwitchingRoute,
            MigrationPhase::Cleanup,
            MigrationPhase::Complete,
            MigrationPhase::Failed,
        ]
        .into_iter()
        .filter(|p| p.is_paused())
        .collect();
        assert_eq!(paused, vec![MigrationPhase::FinalSync, MigrationPhase::SwitchingRoute]);
    }

    #[test]
    fn cleanup_no_longer_blocks_the_account() {
        assert!(MigrationPhase::CopyingGcra.is_active());
        assert!(!MigrationPhase::Cleanup.is_active());
        assert!(!MigrationPhase::Failed.is_active());
        assert_eq!(MigrationPhase::ConvergingDelta.to_string(), "converging_delta");
    }
}
