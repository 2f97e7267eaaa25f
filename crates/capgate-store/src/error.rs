//! Error types for the backing store.

/// The result type used throughout capgate-store.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by store commands and scripts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A command was applied to a key holding a different type.
    #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// `RESTORE` without replace targeted an existing key.
    #[error("BUSYKEY target key {key} already exists")]
    BusyKey {
        /// The offending key.
        key: String,
    },

    /// A dump payload failed its checksum or could not be decoded.
    #[error("invalid dump payload: {message}")]
    InvalidDump {
        /// Description of the failure.
        message: String,
    },

    /// A script raised an error; no writes from the call are visible.
    #[error("script {script} failed: {message}")]
    Script {
        /// Script name.
        script: String,
        /// Error raised by the script.
        message: String,
    },

    /// A command received malformed arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store lock was poisoned by a panicking writer.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A shared primitive failed.
    #[error(transparent)]
    Core(#[from] capgate_core::Error),
}

impl Error {
    /// Creates a script error.
    #[must_use]
    pub fn script(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            script: script.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(err.into())
    }
}
