//! Declared ceilings per function version.
//!
//! A [`ConstraintConfig`] is what the function author configured. Each
//! submitted [`ConstraintItem`](crate::constraint::ConstraintItem) is matched
//! against it; a constraint with no matching entry has a limit of zero.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constraint::{
    ConcurrencyConstraint, ConcurrencyMode, RateLimitConstraint, Scope, ThrottleConstraint,
};

/// The caller's declared ceilings for one `(function, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstraintConfig {
    /// Monotonically non-decreasing function version. Zero means unset.
    #[serde(rename = "v")]
    pub function_version: u32,
    /// Concurrency ceilings.
    #[serde(rename = "c", default)]
    pub concurrency: ConcurrencyConfig,
    /// Rate-limit entries.
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimitConfig>,
    /// Throttle entries.
    #[serde(rename = "t", default, skip_serializing_if = "Vec::is_empty")]
    pub throttles: Vec<ThrottleConfig>,
}

/// Concurrency ceilings per scope and mode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Account-wide step concurrency.
    #[serde(rename = "ac", default)]
    pub account_concurrency: u32,
    /// Account-wide run concurrency.
    #[serde(rename = "arc", default)]
    pub account_run_concurrency: u32,
    /// Function step concurrency.
    #[serde(rename = "fc", default)]
    pub function_concurrency: u32,
    /// Function run concurrency.
    #[serde(rename = "frc", default)]
    pub function_run_concurrency: u32,
    /// Custom-key ceilings.
    #[serde(rename = "cck", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrencyLimit>,
}

/// A ceiling for one custom concurrency key expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyLimit {
    /// Step or run mode.
    #[serde(rename = "m", default)]
    pub mode: ConcurrencyMode,
    /// Scope the key expression is evaluated within.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Maximum items in flight per evaluated key.
    #[serde(rename = "l")]
    pub limit: u32,
    /// Hash of the key expression.
    #[serde(rename = "h")]
    pub key_expression_hash: String,
}

/// A declared rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Scope the rate limit applies at.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Requests allowed per period.
    #[serde(rename = "l")]
    pub limit: u32,
    /// Period in seconds.
    #[serde(rename = "p")]
    pub period_secs: u32,
    /// Hash of the key expression.
    #[serde(rename = "h", default)]
    pub key_expression_hash: String,
}

impl RateLimitConfig {
    /// Burst allowance: one tenth of the limit.
    #[must_use]
    pub const fn burst(&self) -> u32 {
        self.limit / 10
    }

    /// Returns the period as a duration.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.period_secs))
    }
}

/// A declared throttle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Scope the throttle applies at.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Requests allowed per period.
    #[serde(rename = "l")]
    pub limit: u32,
    /// Additional burst on top of one request.
    #[serde(rename = "b", default)]
    pub burst: u32,
    /// Period in seconds.
    #[serde(rename = "p")]
    pub period_secs: u32,
    /// Hash of the key expression.
    #[serde(rename = "h", default)]
    pub key_expression_hash: String,
}

impl ThrottleConfig {
    /// Returns the period as a duration.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.period_secs))
    }
}

impl ConstraintConfig {
    /// Resolves the ceiling for a concurrency constraint.
    ///
    /// Custom keys match on mode, scope and expression hash. Otherwise the
    /// scope default applies; environments carry no default ceiling.
    #[must_use]
    pub fn concurrency_limit(&self, constraint: &ConcurrencyConstraint) -> u32 {
        if constraint.is_custom_key() {
            return self
                .concurrency
                .custom_concurrency_keys
                .iter()
                .find(|c| {
                    c.mode == constraint.mode
                        && c.scope == constraint.scope
                        && c.key_expression_hash == constraint.key_expression_hash
                })
                .map_or(0, |c| c.limit);
        }

        let c = &self.concurrency;
        match (constraint.scope, constraint.mode) {
            (Scope::Function, ConcurrencyMode::Step) => c.function_concurrency,
            (Scope::Function, ConcurrencyMode::Run) => c.function_run_concurrency,
            (Scope::Account, ConcurrencyMode::Step) => c.account_concurrency,
            (Scope::Account, ConcurrencyMode::Run) => c.account_run_concurrency,
            (Scope::Env, _) => 0,
        }
    }

    /// Finds the throttle entry matching a throttle constraint.
    #[must_use]
    pub fn throttle_for(&self, constraint: &ThrottleConstraint) -> Option<&ThrottleConfig> {
        self.throttles.iter().find(|t| {
            t.scope == constraint.scope && t.key_expression_hash == constraint.key_expression_hash
        })
    }

    /// Finds the rate-limit entry matching a rate-limit constraint.
    #[must_use]
    pub fn rate_limit_for(&self, constraint: &RateLimitConstraint) -> Option<&RateLimitConfig> {
        self.rate_limits.iter().find(|r| {
            r.scope == constraint.scope && r.key_expression_hash == constraint.key_expression_hash
        })
    }
}
