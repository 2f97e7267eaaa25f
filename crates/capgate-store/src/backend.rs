//! The backing-store contract.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::script::Script;
use crate::value::KeyType;

/// A key/value shard with server-side scripting.
///
/// The admission engine only ever mutates state through [`eval`]; the typed
/// commands exist for key migration and operational tooling. Every key a
/// script touches must share the caller's hash tag.
///
/// [`eval`]: KeyValueStore::eval
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Name of the shard, used for routing and logs.
    fn name(&self) -> &str;

    /// Runs a script atomically and returns its JSON reply.
    ///
    /// Returns `Error::Script` if the script raised; none of its writes are
    /// visible in that case.
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<String>;

    /// Incrementally iterates keys matching a glob pattern.
    ///
    /// Start with cursor `0`; a returned cursor of `0` ends the iteration.
    /// Keys present for the whole iteration are returned at least once.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// Returns the type of a key.
    async fn key_type(&self, key: &str) -> Result<KeyType>;

    /// Remaining TTL in milliseconds (`-2` missing, `-1` persistent).
    async fn pttl(&self, key: &str) -> Result<i64>;

    /// Sets a TTL in milliseconds. Returns false if the key is missing.
    async fn pexpire(&self, key: &str, ttl_ms: i64) -> Result<bool>;

    /// Serializes a key's value. Returns `None` if the key is missing.
    async fn dump(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Recreates a key from a dump payload; `ttl_ms == 0` means persistent.
    async fn restore(&self, key: &str, ttl_ms: i64, payload: &[u8], replace: bool) -> Result<()>;

    /// Deletes keys. Returns the number that existed.
    async fn unlink(&self, keys: &[String]) -> Result<usize>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a string value with an optional TTL in milliseconds.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: Option<i64>) -> Result<()>;

    /// Reads every field of a hash.
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Sets hash fields. Returns the number of new fields.
    async fn hset(&self, key: &str, fields: BTreeMap<String, String>) -> Result<usize>;

    /// Every member of a sorted set with its score, lowest first.
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>>;

    /// Adds or re-scores a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// Removes a sorted-set member.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns a member's score.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>>;
}
