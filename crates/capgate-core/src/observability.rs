//! Logging initialization and span helpers.
//!
//! Spans carry the operation and the account so a single admission decision
//! can be followed across the manager, the dispatcher and the store.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// Levels come from `RUST_LOG` (e.g. `info`, `capgate_engine=debug`).
///
/// # Example
///
/// ```rust
/// use capgate_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        // Another subscriber (e.g. a test harness) may already be installed.
        drop(result);
    });
}

/// Creates a span for a capacity operation.
#[must_use]
pub fn capacity_span(operation: &str, account: &str) -> Span {
    tracing::info_span!("capacity", op = operation, account = account)
}

/// Creates a span for a shard migration.
#[must_use]
pub fn migration_span(account: &str, source: &str, destination: &str) -> Span {
    tracing::info_span!(
        "migration",
        account = account,
        source = source,
        destination = destination,
    )
}
