//! Request dispatch to backing-store shards.
//!
//! The dispatcher is stateless apart from its routing table: it maps a
//! request's [`MigrationIdentifier`] to a store handle plus the key prefix
//! used on that store, runs one script there and decodes the reply.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use capgate_core::KeyPrefix;
use capgate_store::{KeyValueStore, Script};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::reply;
use crate::request::MigrationIdentifier;

/// A store handle and the prefix its keys live under.
#[derive(Clone)]
pub struct DispatchTarget {
    /// Store handle.
    pub store: Arc<dyn KeyValueStore>,
    /// Key prefix on that store.
    pub prefix: KeyPrefix,
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTarget")
            .field("store", &self.store.name())
            .field("prefix", &self.prefix.as_str())
            .finish()
    }
}

impl DispatchTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: KeyPrefix) -> Self {
        Self { store, prefix }
    }
}

/// Routes scripts to the store a request targets.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    default: DispatchTarget,
    rate_limit: Option<DispatchTarget>,
    queue_shards: HashMap<String, DispatchTarget>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    /// Creates a dispatcher that sends everything to `default`.
    #[must_use]
    pub fn new(default: DispatchTarget) -> Self {
        Self {
            default,
            rate_limit: None,
            queue_shards: HashMap::new(),
            timeout: None,
        }
    }

    /// Routes rate-limit requests to a separate target.
    #[must_use]
    pub fn with_rate_limit(mut self, target: DispatchTarget) -> Self {
        self.rate_limit = Some(target);
        self
    }

    /// Registers a named queue-state shard.
    #[must_use]
    pub fn with_queue_shard(mut self, name: impl Into<String>, target: DispatchTarget) -> Self {
        self.queue_shards.insert(name.into(), target);
        self
    }

    /// Bounds every script call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The default target.
    #[must_use]
    pub fn default_target(&self) -> &DispatchTarget {
        &self.default
    }

    /// Resolves the target of a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShardNotFound`] for an unregistered queue shard.
    pub fn resolve(&self, migration: &MigrationIdentifier) -> Result<&DispatchTarget> {
        if let Some(name) = &migration.queue_shard {
            return self
                .queue_shards
                .get(name)
                .ok_or_else(|| Error::ShardNotFound {
                    shard: name.clone(),
                });
        }
        if migration.is_rate_limit {
            return Ok(self.rate_limit.as_ref().unwrap_or(&self.default));
        }
        Ok(&self.default)
    }

    /// Runs `script` on `target` and decodes the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the call fails, [`Error::Timeout`] when
    /// it outlives the configured timeout and [`Error::MalformedResponse`]
    /// when the reply does not decode.
    pub async fn eval<R: DeserializeOwned>(
        &self,
        target: &DispatchTarget,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<R> {
        let call = target.store.eval(script, keys, args);
        let raw = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| Error::Timeout {
                    script: script.name().to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })??,
            None => call.await?,
        };
        tracing::trace!(
            store = target.store.name(),
            script = script.name(),
            keys = keys.len(),
            "script reply received"
        );
        reply::decode(script.name(), &raw)
    }
}
