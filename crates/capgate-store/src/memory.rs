//! In-process implementation of [`KeyValueStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use capgate_core::SharedClock;

use crate::backend::KeyValueStore;
use crate::error::{Error, Result};
use crate::keyspace::Keyspace;
use crate::script::{self, Script};
use crate::value::KeyType;

#[derive(Debug, Default)]
struct ShardState {
    keyspace: Keyspace,
    script_calls: HashMap<&'static str, u64>,
}

/// One in-memory shard.
///
/// All commands serialize on a single lock, which makes every script call
/// atomic with respect to every other command on the shard. Time comes from
/// the injected clock so expirations follow a test's fake clock.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: Arc<str>,
    clock: SharedClock,
    state: Arc<Mutex<ShardState>>,
}

impl MemoryStore {
    /// Creates an empty shard.
    #[must_use]
    pub fn new(name: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            name: Arc::from(name.into()),
            clock,
            state: Arc::new(Mutex::new(ShardState::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ShardState>> {
        self.state
            .lock()
            .map_err(|_| Error::Unavailable(format!("shard {} lock poisoned", self.name)))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Number of times `script` has been evaluated on this shard.
    #[must_use]
    pub fn script_calls(&self, script: &str) -> u64 {
        self.lock()
            .map(|s| s.script_calls.get(script).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total number of script evaluations on this shard.
    #[must_use]
    pub fn total_script_calls(&self) -> u64 {
        self.lock()
            .map(|s| s.script_calls.values().sum())
            .unwrap_or(0)
    }

    /// Number of live keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let now = self.now_ms();
        self.lock().map(|s| s.keyspace.len(now)).unwrap_or(0)
    }

    /// Every live key, sorted. Intended for tests and debugging.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.now_ms();
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = state.keyspace.scan(cursor, "*", 1_000, now);
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<String> {
        let now_ms = self.now_ms();
        let now_ns = self.clock.now_ns();
        let mut state = self.lock()?;
        *state.script_calls.entry(script.name()).or_default() += 1;
        let reply = script::run(&mut state.keyspace, script, keys, args, now_ms, now_ns);
        if let Err(err) = &reply {
            tracing::debug!(shard = %self.name, script = script.name(), error = %err, "script failed");
        }
        reply
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let now = self.now_ms();
        let mut state = self.lock()?;
        if cursor == 0 {
            state.keyspace.purge_expired(now);
        }
        Ok(state.keyspace.scan(cursor, pattern, count, now))
    }

    async fn key_type(&self, key: &str) -> Result<KeyType> {
        let now = self.now_ms();
        Ok(self.lock()?.keyspace.key_type(key, now))
    }

    async fn pttl(&self, key: &str) -> Result<i64> {
        let now = self.now_ms();
        Ok(self.lock()?.keyspace.pttl(key, now))
    }

    async fn pexpire(&self, key: &str, ttl_ms: i64) -> Result<bool> {
        let now = self.now_ms();
        Ok(self.lock()?.keyspace.pexpire(key, ttl_ms, now))
    }

    async fn dump(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.now_ms();
        self.lock()?.keyspace.dump(key, now)
    }

    async fn restore(&self, key: &str, ttl_ms: i64, payload: &[u8], replace: bool) -> Result<()> {
        let now = self.now_ms();
        self.lock()?
            .keyspace
            .restore(key, ttl_ms, payload, replace, now)
    }

    async fn unlink(&self, keys: &[String]) -> Result<usize> {
        let now = self.now_ms();
        let mut state = self.lock()?;
        Ok(keys
            .iter()
            .filter(|key| state.keyspace.del(key, now))
            .count())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.now_ms();
        self.lock()?.keyspace.get(key, now)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: Option<i64>) -> Result<()> {
        let now = self.now_ms();
        self.lock()?.keyspace.set(key, value, ttl_ms, now);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let now = self.now_ms();
        self.lock()?.keyspace.hgetall(key, now)
    }

    async fn hset(&self, key: &str, fields: BTreeMap<String, String>) -> Result<usize> {
        let now = self.now_ms();
        self.lock()?.keyspace.hset(key, fields, now)
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>> {
        let now = self.now_ms();
        self.lock()?
            .keyspace
            .zrange_by_score(key, i64::MIN, i64::MAX, None, now)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let now = self.now_ms();
        self.lock()?.keyspace.zadd(key, member, score, now)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.now_ms();
        self.lock()?.keyspace.zrem(key, member, now)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let now = self.now_ms();
        self.lock()?.keyspace.zscore(key, member, now)
    }
}
