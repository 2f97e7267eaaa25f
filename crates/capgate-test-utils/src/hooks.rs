//! Lifecycle hooks that record what they observe.

use std::sync::Mutex;

use async_trait::async_trait;
use capgate_engine::lifecycle::{LeaseLifecycleHook, ReclaimedLease};

/// Collects every reclaimed lease.
#[derive(Debug, Default)]
pub struct RecordingHook {
    reclaimed: Mutex<Vec<ReclaimedLease>>,
}

impl RecordingHook {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases reclaimed so far, in delivery order.
    #[must_use]
    pub fn reclaimed(&self) -> Vec<ReclaimedLease> {
        self.reclaimed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeaseLifecycleHook for RecordingHook {
    async fn on_reclaimed(&self, lease: &ReclaimedLease) {
        self.reclaimed.lock().unwrap().push(lease.clone());
    }
}
