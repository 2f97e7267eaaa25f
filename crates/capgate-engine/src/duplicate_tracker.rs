//! Debounced counter of repeated acquire fingerprints.
//!
//! The first `track` of a fingerprint starts a one-shot timer of the
//! configured window. Further tracks within the window only bump the count.
//! When the timer fires, counts above one are reported and the entry is
//! dropped; an account whose last entry is dropped is forgotten.
//!
//! Locks are taken accounts map first, then the account's own map, and are
//! never held across an await. `track`, `flush` and `count` all hold the
//! accounts lock while touching an account's entries.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use capgate_core::AccountId;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::metrics::CapacityMetrics;

/// Receives the count of a fingerprint seen more than once in a window.
pub trait DuplicateReporter: Send + Sync + fmt::Debug {
    /// Called once per window for fingerprints with `count > 1`.
    fn report(&self, account: AccountId, fingerprint: &str, count: u64);
}

impl DuplicateReporter for CapacityMetrics {
    fn report(&self, _account: AccountId, _fingerprint: &str, count: u64) {
        self.observe_duplicate_requests(count);
    }
}

#[derive(Default)]
struct AccountEntries {
    counts: HashMap<String, u64>,
    timers: HashMap<String, JoinHandle<()>>,
}

type Shared<T> = Arc<Mutex<T>>;

struct Inner {
    accounts: Mutex<HashMap<AccountId, Shared<AccountEntries>>>,
    reporter: Arc<dyn DuplicateReporter>,
}

/// Per-account duplicate-request tracker.
#[derive(Clone)]
pub struct DuplicateTracker {
    window: Duration,
    inner: Arc<Inner>,
}

impl fmt::Debug for DuplicateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicateTracker")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl DuplicateTracker {
    /// Creates a tracker; a zero window disables it.
    #[must_use]
    pub fn new(window: Duration, reporter: Arc<dyn DuplicateReporter>) -> Self {
        Self {
            window,
            inner: Arc::new(Inner {
                accounts: Mutex::new(HashMap::new()),
                reporter,
            }),
        }
    }

    /// Creates a tracker that reports into the duplicate-request histogram.
    #[must_use]
    pub fn with_metrics(window: Duration) -> Self {
        Self::new(window, Arc::new(CapacityMetrics::new()))
    }

    /// Returns true when tracking is off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.window.is_zero()
    }

    /// Counts one occurrence of `fingerprint` for `account`.
    ///
    /// Outside a tokio runtime the first occurrence is counted but no timer
    /// can be armed, so it is dropped again immediately.
    pub fn track(&self, account: AccountId, fingerprint: &str) {
        if self.is_disabled() || fingerprint.is_empty() {
            return;
        }

        // The accounts guard stays held so a concurrent flush cannot detach
        // the entries between lookup and update.
        let mut accounts = lock(&self.inner.accounts);
        let shared = Arc::clone(accounts.entry(account).or_default());
        let mut entries = lock(&shared);

        if let Some(count) = entries.counts.get_mut(fingerprint) {
            *count += 1;
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            tracing::debug!(%account, "no runtime; duplicate tracking skipped");
            if entries.counts.is_empty() {
                drop(entries);
                accounts.remove(&account);
            }
            return;
        };
        entries.counts.insert(fingerprint.to_string(), 1);

        let tracker = self.clone();
        let key = fingerprint.to_string();
        let timer = handle.spawn(async move {
            tokio::time::sleep(tracker.window).await;
            tracker.flush(account, &key);
        });
        entries.timers.insert(fingerprint.to_string(), timer);
    }

    fn flush(&self, account: AccountId, fingerprint: &str) {
        let mut accounts = lock(&self.inner.accounts);
        let Some(entries) = accounts.get(&account).map(Arc::clone) else {
            return;
        };
        let count = {
            let mut entries = lock(&entries);
            entries.timers.remove(fingerprint);
            let count = entries.counts.remove(fingerprint);
            if entries.counts.is_empty() {
                accounts.remove(&account);
            }
            count
        };
        drop(accounts);

        if let Some(count) = count.filter(|c| *c > 1) {
            self.inner.reporter.report(account, fingerprint, count);
        }
    }

    /// Current count of a fingerprint.
    #[must_use]
    pub fn count(&self, account: AccountId, fingerprint: &str) -> u64 {
        let accounts = lock(&self.inner.accounts);
        accounts
            .get(&account)
            .and_then(|e| lock(e).counts.get(fingerprint).copied())
            .unwrap_or(0)
    }

    /// Number of accounts with live entries.
    #[must_use]
    pub fn tracked_accounts(&self) -> usize {
        lock(&self.inner.accounts).len()
    }

    /// Cancels every timer and drops all state.
    pub fn shutdown(&self) {
        let mut accounts = lock(&self.inner.accounts);
        for (_, entries) in accounts.drain() {
            let mut entries = lock(&entries);
            for (_, timer) in entries.timers.drain() {
                timer.abort();
            }
            entries.counts.clear();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<(String, u64)>>);

    impl DuplicateReporter for Recorder {
        fn report(&self, _account: AccountId, fingerprint: &str, count: u64) {
            lock(&self.0).push((fingerprint.to_string(), count));
        }
    }

    fn tracker(window_ms: u64) -> (Arc<Recorder>, DuplicateTracker) {
        let recorder = Arc::new(Recorder::default());
        let tracker = DuplicateTracker::new(Duration::from_millis(window_ms), recorder.clone());
        (recorder, tracker)
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_are_reported_once_per_window() {
        let (recorder, tracker) = tracker(1_000);
        let account = AccountId::generate();
        for _ in 0..3 {
            tracker.track(account, "fp");
        }
        tracker.track(account, "single");
        assert_eq!(tracker.count(account, "fp"), 3);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        tokio::task::yield_now().await;

        assert_eq!(*lock(&recorder.0), vec![("fp".to_string(), 3)]);
        assert_eq!(tracker.count(account, "fp"), 0);
        assert_eq!(tracker.tracked_accounts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_and_empty_fingerprints_are_ignored() {
        let (_, disabled) = tracker(0);
        let account = AccountId::generate();
        disabled.track(account, "fp");
        assert_eq!(disabled.tracked_accounts(), 0);

        let (_, enabled) = tracker(1_000);
        enabled.track(account, "");
        assert_eq!(enabled.tracked_accounts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_reports() {
        let (recorder, tracker) = tracker(1_000);
        let account = AccountId::generate();
        tracker.track(account, "fp");
        tracker.track(account, "fp");
        tracker.shutdown();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(lock(&recorder.0).is_empty());
        assert_eq!(tracker.tracked_accounts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_tracks_are_all_counted() {
        let (recorder, tracker) = tracker(1_000);
        let account = AccountId::generate();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.track(account, "fp") })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(*lock(&recorder.0), vec![("fp".to_string(), 16)]);
    }

    #[test]
    fn tracking_outside_a_runtime_leaves_no_state() {
        let (_, tracker) = tracker(1_000);
        tracker.track(AccountId::generate(), "fp");
        assert_eq!(tracker.tracked_accounts(), 0);
    }

    #[test]
    fn tracks_racing_flushes_lose_no_counts() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_time()
            .build()
            .unwrap();
        let (recorder, tracker) = tracker(5);
        let account = AccountId::generate();
        let rounds = 200_u64;

        runtime.block_on(async {
            let tasks: Vec<_> = ["fp1", "fp2"]
                .into_iter()
                .map(|fp| {
                    let tracker = tracker.clone();
                    tokio::spawn(async move {
                        for _ in 0..rounds {
                            // Pairs land in one window, so every window is reported.
                            tracker.track(account, fp);
                            tracker.track(account, fp);
                            tokio::time::sleep(Duration::from_micros(300)).await;
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let reports = lock(&recorder.0).clone();
        for fp in ["fp1", "fp2"] {
            let total: u64 = reports.iter().filter(|(f, _)| f == fp).map(|(_, c)| c).sum();
            assert_eq!(total, rounds * 2, "{fp}");
        }
        assert_eq!(tracker.tracked_accounts(), 0);
    }
}
