//! Per-account migration state shared by the coordinator, the routing
//! manager and the scavenger.
//!
//! Every operation that may write an account's state on its current shard
//! enters through [`MigrationRegistry::begin`]. The returned ticket counts
//! the operation as in flight; [`OperationTicket::finish`] marks the keys it
//! wrote as dirty when a migration of the account is running by then. The
//! final sync pauses the account and waits for the in-flight count to reach
//! zero, so no write lands on the source after the last dirty drain.
//!
//! All state sits behind one mutex, which is never held across an await.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use capgate_core::AccountId;
use tokio::sync::Notify;

use super::dirty::DirtyKeyTracker;
use super::phase::MigrationPhase;
use crate::error::{Error, Result};

/// The kind of operation asking to run against an account's shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Capacity probe.
    Check,
    /// Lease grant.
    Acquire,
    /// Lease extension.
    Extend,
    /// Lease release.
    Release,
    /// Scavenger reclamation.
    Reclaim,
}

impl OperationKind {
    const fn blocked_during(self, phase: MigrationPhase) -> bool {
        match self {
            Self::Acquire | Self::Reclaim => phase.is_active(),
            Self::Check | Self::Extend | Self::Release => phase.is_paused(),
        }
    }
}

/// Outcome of [`MigrationRegistry::begin`].
#[derive(Debug)]
pub enum Gate {
    /// The operation may run; hold the ticket until it finishes.
    Open(OperationTicket),
    /// A migration forbids the operation right now.
    Blocked(MigrationPhase),
}

#[derive(Debug)]
struct ActiveMigration {
    phase: MigrationPhase,
    dirty: Arc<DirtyKeyTracker>,
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: usize,
    migration: Option<ActiveMigration>,
}

impl Slot {
    fn is_vacant(&self) -> bool {
        self.in_flight == 0 && self.migration.is_none()
    }
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<AccountId, Slot>>,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<AccountId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to migration state.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("active", &self.active_accounts().len())
            .finish()
    }
}

impl MigrationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits or blocks an operation on `account`.
    #[must_use]
    pub fn begin(&self, account: AccountId, kind: OperationKind) -> Gate {
        let mut slots = self.inner.lock();
        let slot = slots.entry(account).or_default();
        let phase = slot.migration.as_ref().map_or(MigrationPhase::Idle, |m| m.phase);
        if kind.blocked_during(phase) {
            if slot.is_vacant() {
                slots.remove(&account);
            }
            return Gate::Blocked(phase);
        }
        slot.in_flight += 1;
        Gate::Open(OperationTicket {
            inner: Arc::clone(&self.inner),
            account,
        })
    }

    /// Current phase of `account`, [`MigrationPhase::Idle`] when none runs.
    #[must_use]
    pub fn phase(&self, account: AccountId) -> MigrationPhase {
        self.inner
            .lock()
            .get(&account)
            .and_then(|s| s.migration.as_ref())
            .map_or(MigrationPhase::Idle, |m| m.phase)
    }

    /// Accounts with a running migration.
    #[must_use]
    pub fn active_accounts(&self) -> Vec<AccountId> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, s)| s.migration.is_some())
            .map(|(a, _)| *a)
            .collect()
    }

    /// Operations currently running against `account`.
    #[must_use]
    pub fn in_flight(&self, account: AccountId) -> usize {
        self.inner.lock().get(&account).map_or(0, |s| s.in_flight)
    }

    /// Registers a migration of `account`, blocking new acquires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MigrationInProgress`] when one is already running.
    pub(crate) fn start(&self, account: AccountId) -> Result<Arc<DirtyKeyTracker>> {
        let mut slots = self.inner.lock();
        let slot = slots.entry(account).or_default();
        if slot.migration.is_some() {
            return Err(Error::MigrationInProgress { account });
        }
        let dirty = Arc::new(DirtyKeyTracker::new());
        slot.migration = Some(ActiveMigration {
            phase: MigrationPhase::CopyingGcra,
            dirty: Arc::clone(&dirty),
        });
        Ok(dirty)
    }

    pub(crate) fn set_phase(&self, account: AccountId, phase: MigrationPhase) {
        if let Some(migration) = self
            .inner
            .lock()
            .get_mut(&account)
            .and_then(|s| s.migration.as_mut())
        {
            migration.phase = phase;
        }
    }

    /// Enters the final sync and waits until no operation is in flight.
    pub(crate) async fn pause(&self, account: AccountId) {
        self.set_phase(account, MigrationPhase::FinalSync);
        loop {
            let idle = self.inner.idle.notified();
            if self.in_flight(account) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Drops the migration of `account`, unblocking every operation.
    pub(crate) fn end(&self, account: AccountId) {
        let mut slots = self.inner.lock();
        if let Some(slot) = slots.get_mut(&account) {
            slot.migration = None;
            if slot.is_vacant() {
                slots.remove(&account);
            }
        }
    }
}

/// An admitted operation. Dropping it without [`finish`](Self::finish)
/// records no writes.
#[must_use = "dropping the ticket ends the operation"]
pub struct OperationTicket {
    inner: Arc<Inner>,
    account: AccountId,
}

impl fmt::Debug for OperationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTicket")
            .field("account", &self.account)
            .finish()
    }
}

impl OperationTicket {
    /// Ends the operation, marking `written_keys` dirty if a migration of
    /// the account is copying its state.
    pub fn finish(self, written_keys: &[String]) {
        if written_keys.is_empty() {
            return;
        }
        let dirty = self
            .inner
            .lock()
            .get(&self.account)
            .and_then(|s| s.migration.as_ref())
            .map(|m| Arc::clone(&m.dirty));
        if let Some(dirty) = dirty {
            dirty.mark_all(written_keys.iter().map(String::as_str));
        }
    }
}

impl Drop for OperationTicket {
    fn drop(&mut self) {
        let mut slots = self.inner.lock();
        let Some(slot) = slots.get_mut(&self.account) else {
            return;
        };
        slot.in_flight = slot.in_flight.saturating_sub(1);
        let idle = slot.in_flight == 0;
        if slot.is_vacant() {
            slots.remove(&self.account);
        }
        drop(slots);
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}
