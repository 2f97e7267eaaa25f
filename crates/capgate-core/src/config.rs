//! Service configuration.
//!
//! Every field has a serde default so partial documents deserialize, and
//! [`CapacityConfig::from_env`] overlays `CAPGATE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration of the admission service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Prefix of every backing-store key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL of acquire/extend/release response records.
    #[serde(default = "default_operation_idempotency_ttl_secs")]
    pub operation_idempotency_ttl_secs: u64,

    /// TTL of check response records; zero disables check memoization.
    #[serde(default)]
    pub check_idempotency_ttl_secs: u64,

    /// Maximum tolerated distance between caller and server clocks.
    #[serde(default = "default_clock_skew_threshold_ms")]
    pub clock_skew_threshold_ms: u64,

    /// Reject requests whose skew equals the threshold exactly.
    #[serde(default)]
    pub reject_at_threshold: bool,

    /// Number of scavenger shards; fixed per deployment.
    #[serde(default = "default_num_scavenger_shards")]
    pub num_scavenger_shards: u32,

    /// Retry hint for callers denied by a concurrency ceiling with no lease to wait on.
    #[serde(default = "default_concurrency_retry_after_ms")]
    pub concurrency_retry_after_ms: u64,

    /// Duplicate-request tracker window; zero disables tracking.
    #[serde(default)]
    pub duplicate_tracker_window_ms: u64,

    /// Per-call timeout for backing-store scripts; zero disables it.
    #[serde(default)]
    pub operation_timeout_ms: u64,

    /// Client-side admission cache.
    #[serde(default)]
    pub admission_cache: AdmissionCacheConfig,

    /// Lease scavenger.
    #[serde(default)]
    pub scavenger: ScavengerConfig,

    /// Shard migration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

fn default_key_prefix() -> String {
    "capgate".to_string()
}

const fn default_operation_idempotency_ttl_secs() -> u64 {
    3600
}

const fn default_clock_skew_threshold_ms() -> u64 {
    5_000
}

const fn default_num_scavenger_shards() -> u32 {
    16
}

const fn default_concurrency_retry_after_ms() -> u64 {
    1_000
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            operation_idempotency_ttl_secs: default_operation_idempotency_ttl_secs(),
            check_idempotency_ttl_secs: 0,
            clock_skew_threshold_ms: default_clock_skew_threshold_ms(),
            reject_at_threshold: false,
            num_scavenger_shards: default_num_scavenger_shards(),
            concurrency_retry_after_ms: default_concurrency_retry_after_ms(),
            duplicate_tracker_window_ms: 0,
            operation_timeout_ms: 0,
            admission_cache: AdmissionCacheConfig::default(),
            scavenger: ScavengerConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

/// Client-side admission cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCacheConfig {
    /// Global switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower TTL bound in milliseconds.
    #[serde(default = "default_cache_min_ttl_ms")]
    pub min_ttl_ms: u64,
    /// Upper TTL bound in milliseconds.
    #[serde(default = "default_cache_max_ttl_ms")]
    pub max_ttl_ms: u64,
    /// Accounts for which caching is switched off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_accounts: Vec<String>,
}

const fn default_true() -> bool {
    true
}

const fn default_cache_min_ttl_ms() -> u64 {
    500
}

const fn default_cache_max_ttl_ms() -> u64 {
    2_000
}

impl Default for AdmissionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_ttl_ms: default_cache_min_ttl_ms(),
            max_ttl_ms: default_cache_max_ttl_ms(),
            disabled_accounts: Vec::new(),
        }
    }
}

/// Lease scavenger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengerConfig {
    /// Time between passes over all shards.
    #[serde(default = "default_scavenger_interval_ms")]
    pub interval_ms: u64,
    /// Accounts inspected per shard per pass.
    #[serde(default = "default_peek")]
    pub accounts_peek: usize,
    /// Expired leases reclaimed per account per pass.
    #[serde(default = "default_peek")]
    pub leases_peek: usize,
}

const fn default_scavenger_interval_ms() -> u64 {
    1_000
}

const fn default_peek() -> usize {
    20
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scavenger_interval_ms(),
            accounts_peek: default_peek(),
            leases_peek: default_peek(),
        }
    }
}

/// Shard migration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Keys copied per batch.
    #[serde(default = "default_copy_batch_size")]
    pub copy_batch_size: usize,
    /// SCAN count hint.
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
    /// Dirty-set size at which delta convergence stops.
    #[serde(default = "default_delta_convergence_threshold")]
    pub delta_convergence_threshold: usize,
    /// Upper bound on delta passes.
    #[serde(default = "default_max_delta_passes")]
    pub max_delta_passes: usize,
}

const fn default_copy_batch_size() -> usize {
    500
}

const fn default_scan_count() -> usize {
    1_000
}

const fn default_delta_convergence_threshold() -> usize {
    200
}

const fn default_max_delta_passes() -> usize {
    5
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            copy_batch_size: default_copy_batch_size(),
            scan_count: default_scan_count(),
            delta_convergence_threshold: default_delta_convergence_threshold(),
            max_delta_passes: default_max_delta_passes(),
        }
    }
}

impl CapacityConfig {
    /// Loads defaults overlaid with `CAPGATE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed, or if
    /// the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(prefix) = env_string("CAPGATE_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(v) = env_u64("CAPGATE_OPERATION_IDEMPOTENCY_TTL_SECS")? {
            config.operation_idempotency_ttl_secs = v;
        }
        if let Some(v) = env_u64("CAPGATE_CHECK_IDEMPOTENCY_TTL_SECS")? {
            config.check_idempotency_ttl_secs = v;
        }
        if let Some(v) = env_u64("CAPGATE_CLOCK_SKEW_THRESHOLD_MS")? {
            config.clock_skew_threshold_ms = v;
        }
        if let Some(v) = env_bool("CAPGATE_REJECT_AT_THRESHOLD")? {
            config.reject_at_threshold = v;
        }
        if let Some(v) = env_u64("CAPGATE_NUM_SCAVENGER_SHARDS")? {
            config.num_scavenger_shards = u32::try_from(v).map_err(|_| {
                Error::InvalidInput("CAPGATE_NUM_SCAVENGER_SHARDS is out of range".into())
            })?;
        }
        if let Some(v) = env_u64("CAPGATE_DUPLICATE_TRACKER_WINDOW_MS")? {
            config.duplicate_tracker_window_ms = v;
        }
        if let Some(v) = env_u64("CAPGATE_OPERATION_TIMEOUT_MS")? {
            config.operation_timeout_ms = v;
        }
        if let Some(v) = env_u64("CAPGATE_CONCURRENCY_RETRY_AFTER_MS")? {
            config.concurrency_retry_after_ms = v;
        }
        if let Some(v) = env_bool("CAPGATE_ADMISSION_CACHE_ENABLED")? {
            config.admission_cache.enabled = v;
        }
        if let Some(v) = env_u64("CAPGATE_ADMISSION_CACHE_MIN_TTL_MS")? {
            config.admission_cache.min_ttl_ms = v;
        }
        if let Some(v) = env_u64("CAPGATE_ADMISSION_CACHE_MAX_TTL_MS")? {
            config.admission_cache.max_ttl_ms = v;
        }
        if let Some(v) = env_u64("CAPGATE_SCAVENGER_INTERVAL_MS")? {
            config.scavenger.interval_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(Error::InvalidInput("key_prefix must not be empty".into()));
        }
        if self.num_scavenger_shards == 0 {
            return Err(Error::InvalidInput(
                "num_scavenger_shards must be at least 1".into(),
            ));
        }
        if self.admission_cache.min_ttl_ms > self.admission_cache.max_ttl_ms {
            return Err(Error::InvalidInput(
                "admission_cache.min_ttl_ms must not exceed max_ttl_ms".into(),
            ));
        }
        if self.migration.copy_batch_size == 0 || self.migration.scan_count == 0 {
            return Err(Error::InvalidInput(
                "migration batch and scan sizes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// TTL of acquire/extend/release response records.
    #[must_use]
    pub const fn operation_idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.operation_idempotency_ttl_secs)
    }

    /// TTL of check response records.
    #[must_use]
    pub const fn check_idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.check_idempotency_ttl_secs)
    }

    /// Duplicate tracker window.
    #[must_use]
    pub const fn duplicate_tracker_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_tracker_window_ms)
    }

    /// Store call timeout, if any.
    #[must_use]
    pub const fn operation_timeout(&self) -> Option<Duration> {
        if self.operation_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.operation_timeout_ms))
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    env_string(name).map(|v| parse_bool(name, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = CapacityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration.max_delta_passes, 5);
        assert_eq!(config.scavenger.accounts_peek, 20);
        assert_eq!(config.check_idempotency_ttl(), Duration::ZERO);
    }

    #[test]
    fn partial_documents_fill_defaults() -> Result<()> {
        let config: CapacityConfig =
            serde_json::from_str(r#"{"key_prefix":"x","admission_cache":{"enabled":false}}"#)?;
        assert_eq!(config.key_prefix, "x");
        assert!(!config.admission_cache.enabled);
        assert_eq!(config.admission_cache.max_ttl_ms, 2_000);
        assert_eq!(config.num_scavenger_shards, 16);
        Ok(())
    }

    #[test]
    fn inverted_cache_ttls_are_rejected() {
        let mut config = CapacityConfig::default();
        config.admission_cache.min_ttl_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_shards_rejected() {
        let config = CapacityConfig {
            num_scavenger_shards: 0,
            ..CapacityConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
