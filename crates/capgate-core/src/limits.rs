//! Fixed request budgets.

use std::time::Duration;

/// Maximum number of leases one acquire may request.
pub const MAX_ACQUIRE_AMOUNT: u32 = 20;

/// Maximum length of any caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Shortest lease duration accepted.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(2);

/// Longest lease duration accepted.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Maximum rate-limit constraints per request.
pub const MAX_RATE_LIMITS_PER_REQUEST: usize = 1;

/// Maximum throttle constraints per request.
pub const MAX_THROTTLES_PER_REQUEST: usize = 1;
