//! Generic Cell Rate Algorithm.
//!
//! GCRA tracks one scalar per key, the theoretical arrival time (TAT). A
//! request for `q` units is admitted when `now >= TAT + q·T − DVT`, where
//! `T = period / limit` is the emission interval and `DVT = (burst + 1)·T`
//! the delay-variation tolerance.
//!
//! The same arithmetic serves throttles (millisecond timestamps) and rate
//! limits (nanosecond timestamps); [`Resolution`] only decides how the key
//! TTL is derived. All arithmetic saturates so far-future TATs cannot
//! overflow.
//!
//! [`evaluate`] is pure. [`apply`] runs it against a script context and
//! writes the new TAT when a positive quantity is admitted.

use capgate_store::{Result, ScriptContext};

/// Time unit of a GCRA key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Timestamps and periods in milliseconds.
    Millis,
    /// Timestamps and periods in nanoseconds.
    Nanos,
}

impl Resolution {
    /// Converts a duration or timestamp in this resolution to whole
    /// milliseconds, rounding up.
    #[must_use]
    pub const fn to_ms_ceil(self, value: i64) -> i64 {
        match self {
            Self::Millis => value,
            Self::Nanos => value.saturating_add(999_999) / 1_000_000,
        }
    }

    /// Current time in this resolution.
    #[must_use]
    pub fn now(self, ctx: &ScriptContext<'_>) -> i64 {
        match self {
            Self::Millis => ctx.now_ms(),
            Self::Nanos => ctx.now_ns(),
        }
    }
}

/// Rate parameters of one GCRA key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraParams {
    /// Units per period.
    pub limit: i64,
    /// Extra units admissible in a burst.
    pub burst: i64,
    /// Period length in the key's resolution.
    pub period: i64,
}

impl GcraParams {
    /// Emission interval, at least one tick.
    #[must_use]
    pub fn emission_interval(&self) -> i64 {
        if self.limit <= 0 {
            return self.period.max(1);
        }
        (self.period / self.limit).max(1)
    }

    /// Delay-variation tolerance.
    #[must_use]
    pub fn delay_variation_tolerance(&self) -> i64 {
        self.emission_interval()
            .saturating_mul(self.burst.max(0).saturating_add(1))
    }

    /// Units admissible from an empty state.
    #[must_use]
    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            return 0;
        }
        self.burst.max(0).saturating_add(1)
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraOutcome {
    /// The requested quantity (one unit, for a probe) is not admissible now.
    pub limited: bool,
    /// Units still admissible after this evaluation.
    pub remaining: i64,
    /// Effective ceiling (`burst + 1`).
    pub limit: i64,
    /// Time until the request would be admitted; zero when admitted.
    pub retry_after: i64,
    /// Absolute time at which the request would be admitted.
    pub retry_at: i64,
    /// Time until the key drains completely.
    pub reset_after: i64,
    /// TAT to persist, set only when a positive quantity was admitted.
    pub new_tat: Option<i64>,
}

impl GcraOutcome {
    /// Units in use.
    #[must_use]
    pub fn used(&self) -> i64 {
        (self.limit - self.remaining).max(0)
    }
}

/// Evaluates a request for `quantity` units against a stored TAT.
///
/// A zero quantity is a probe: it reports whether one unit is admissible
/// and how many remain, and never yields a TAT to persist.
#[must_use]
pub fn evaluate(stored_tat: Option<i64>, now: i64, params: GcraParams, quantity: i64) -> GcraOutcome {
    if params.limit <= 0 {
        let retry_after = params.period.max(0);
        return GcraOutcome {
            limited: true,
            remaining: 0,
            limit: 0,
            retry_after,
            retry_at: now.saturating_add(retry_after),
            reset_after: 0,
            new_tat: None,
        };
    }

    let interval = params.emission_interval();
    let dvt = params.delay_variation_tolerance();
    let limit = params.effective_limit();

    let tat = stored_tat.map_or(now, |stored| stored.max(now));
    let increment = if quantity <= 0 {
        interval
    } else {
        quantity.saturating_mul(interval)
    };
    let new_tat = tat.saturating_add(increment);
    let allow_at = new_tat.saturating_sub(dvt);
    let diff = now.saturating_sub(allow_at);

    let remaining_from = |tat: i64| {
        let ttl = dvt.saturating_sub(tat.saturating_sub(now));
        (ttl / interval).max(0)
    };

    if diff < 0 {
        let retry_after = diff.saturating_neg();
        return GcraOutcome {
            limited: true,
            remaining: remaining_from(tat),
            limit,
            retry_after,
            retry_at: now.saturating_add(retry_after).min(tat),
            reset_after: tat.saturating_sub(now),
            new_tat: None,
        };
    }

    if quantity <= 0 {
        return GcraOutcome {
            limited: false,
            remaining: remaining_from(tat),
            limit,
            retry_after: 0,
            retry_at: now,
            reset_after: tat.saturating_sub(now),
            new_tat: None,
        };
    }

    GcraOutcome {
        limited: false,
        remaining: remaining_from(new_tat),
        limit,
        retry_after: 0,
        retry_at: now,
        reset_after: new_tat.saturating_sub(now),
        new_tat: Some(new_tat),
    }
}

/// Evaluates `key` inside a script and persists the admitted TAT.
///
/// The key expires `period + DVT` after the write.
///
/// # Errors
///
/// Returns an error if the key holds something other than an integer.
pub fn apply(
    ctx: &mut ScriptContext<'_>,
    key: &str,
    resolution: Resolution,
    params: GcraParams,
    quantity: i64,
) -> Result<GcraOutcome> {
    let now = resolution.now(ctx);
    let stored = ctx.get_i64(key)?;
    let outcome = evaluate(stored, now, params, quantity);
    if let Some(tat) = outcome.new_tat {
        let ttl = resolution.to_ms_ceil(
            params
                .period
                .saturating_add(params.delay_variation_tolerance()),
        );
        ctx.set(key, tat.to_string(), Some(ttl.max(1)));
    }
    Ok(outcome)
}
