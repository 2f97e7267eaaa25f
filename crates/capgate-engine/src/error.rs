//! Error types for the admission engine.
//!
//! Errors travel on one of two channels. User errors are caused by the
//! request and will recur until the caller fixes its input; internal errors
//! come from the backing store or the engine itself.

use capgate_core::AccountId;

/// The result type used throughout capgate-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The channel an error is reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorChannel {
    /// Caused by the request.
    User,
    /// Caused by the service or its backing store.
    Internal,
}

/// Errors raised by capacity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request failed validation.
    #[error("invalid {field}: {message}")]
    Validation {
        /// The offending request field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The caller's clock drifts too far from the server's.
    #[error("clock skew of {skew_ms}ms exceeds threshold of {threshold_ms}ms")]
    ClockSkew {
        /// Absolute skew between caller and server time.
        skew_ms: i64,
        /// Configured threshold.
        threshold_ms: u64,
    },

    /// A backing-store command or script failed.
    #[error("store error: {0}")]
    Store(#[from] capgate_store::Error),

    /// A script reply could not be decoded.
    #[error("malformed {script} response: {message}")]
    MalformedResponse {
        /// Script that produced the reply.
        script: String,
        /// Decoder error.
        message: String,
    },

    /// A store call did not finish within the configured timeout.
    #[error("{script} timed out after {timeout_ms}ms")]
    Timeout {
        /// Script that was running.
        script: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// A shard migration aborted; the account stays on its source shard.
    #[error("migration of account {account} failed during {phase}: {message}")]
    MigrationFailed {
        /// Account being migrated.
        account: AccountId,
        /// Phase that failed.
        phase: String,
        /// Cause of the failure.
        message: String,
    },

    /// The account is in the final sync of a migration; retry shortly.
    #[error("account {account} is being migrated")]
    MigrationInProgress {
        /// Account being migrated.
        account: AccountId,
    },

    /// No shard is registered under the requested name.
    #[error("shard not found: {shard}")]
    ShardNotFound {
        /// The requested shard.
        shard: String,
    },

    /// An engine invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// A shared primitive failed.
    #[error("core error: {0}")]
    Core(#[from] capgate_core::Error),
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the channel this error is reported on.
    #[must_use]
    pub const fn channel(&self) -> ErrorChannel {
        match self {
            Self::Validation { .. } | Self::ClockSkew { .. } => ErrorChannel::User,
            _ => ErrorChannel::Internal,
        }
    }

    /// Returns true for errors caused by the request.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(self.channel(), ErrorChannel::User)
    }

    /// Returns true when retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MigrationInProgress { .. } | Self::Timeout { .. } | Self::Store(_)
        )
    }
}
