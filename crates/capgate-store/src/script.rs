//! Server-side scripting.
//!
//! A [`Script`] is a named function that runs against one shard's keyspace
//! while the shard lock is held, so every read and write it performs is
//! observed atomically by other callers. Writes are journaled per key; a
//! script that returns an error leaves no trace.
//!
//! Replies cross the boundary as JSON text. Empty arrays are encoded as
//! empty objects (`{}`), matching the behavior of embedded scripting
//! runtimes that cannot tell the two apart. Decoders must accept both.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};
use crate::keyspace::{Entry, Keyspace};
use crate::value::KeyType;

/// Body of a script: `(context, KEYS, ARGV) -> reply`.
pub type ScriptFn =
    fn(&mut ScriptContext<'_>, &[String], &[String]) -> Result<serde_json::Value>;

/// A named server-side script.
#[derive(Clone, Copy)]
pub struct Script {
    name: &'static str,
    body: ScriptFn,
}

impl Script {
    /// Creates a script.
    #[must_use]
    pub const fn new(name: &'static str, body: ScriptFn) -> Self {
        Self { name, body }
    }

    /// Returns the script name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// View of a keyspace handed to a running script.
///
/// The current time is fixed when the script starts.
pub struct ScriptContext<'a> {
    keyspace: &'a mut Keyspace,
    now_ms: i64,
    now_ns: i64,
    journal: HashMap<String, Option<Entry>>,
}

impl fmt::Debug for ScriptContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("now_ms", &self.now_ms)
            .field("touched", &self.journal.len())
            .finish_non_exhaustive()
    }
}

impl<'a> ScriptContext<'a> {
    fn new(keyspace: &'a mut Keyspace, now_ms: i64, now_ns: i64) -> Self {
        Self {
            keyspace,
            now_ms,
            now_ns,
            journal: HashMap::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        if !self.journal.contains_key(key) {
            self.journal
                .insert(key.to_string(), self.keyspace.snapshot(key));
        }
    }

    fn rollback(self) {
        for (key, entry) in self.journal {
            self.keyspace.restore_snapshot(&key, entry);
        }
    }

    /// Server time in unix milliseconds.
    #[must_use]
    pub const fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Server time in unix nanoseconds.
    #[must_use]
    pub const fn now_ns(&self) -> i64 {
        self.now_ns
    }

    /// Keys written so far, sorted.
    #[must_use]
    pub fn touched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.journal.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns true when the key exists.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.keyspace.exists(key, self.now_ms)
    }

    /// Returns the type of the key.
    #[must_use]
    pub fn key_type(&self, key: &str) -> KeyType {
        self.keyspace.key_type(key, self.now_ms)
    }

    /// Reads a string value as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type or invalid UTF-8.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.keyspace
            .get(key, self.now_ms)?
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| Error::InvalidArgument(format!("{key} is not valid UTF-8")))
            })
            .transpose()
    }

    /// Reads a string value holding a decimal integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an integer.
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.get(key)?
            .map(|s| {
                s.parse::<i64>()
                    .map_err(|_| Error::InvalidArgument(format!("{key} is not an integer")))
            })
            .transpose()
    }

    /// Writes a string value with an optional TTL in milliseconds.
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>, ttl_ms: Option<i64>) {
        self.touch(key);
        self.keyspace.set(key, value.into(), ttl_ms, self.now_ms);
    }

    /// Deletes a key. Returns true when it existed.
    pub fn del(&mut self, key: &str) -> bool {
        self.touch(key);
        self.keyspace.del(key, self.now_ms)
    }

    /// Sets a TTL in milliseconds.
    pub fn pexpire(&mut self, key: &str, ttl_ms: i64) -> bool {
        self.touch(key);
        self.keyspace.pexpire(key, ttl_ms, self.now_ms)
    }

    /// Remaining TTL in milliseconds (`-2` missing, `-1` persistent).
    #[must_use]
    pub fn pttl(&self, key: &str) -> i64 {
        self.keyspace.pttl(key, self.now_ms)
    }

    /// Reads one hash field.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.keyspace.hget(key, field, self.now_ms)
    }

    /// Reads every hash field.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        self.keyspace.hgetall(key, self.now_ms)
    }

    /// Sets hash fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn hset<I, F, V>(&mut self, key: &str, fields: I) -> Result<usize>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        self.touch(key);
        self.keyspace.hset(
            key,
            fields.into_iter().map(|(f, v)| (f.into(), v.into())),
            self.now_ms,
        )
    }

    /// Deletes a hash field.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        self.touch(key);
        self.keyspace.hdel(key, field, self.now_ms)
    }

    /// Adds or re-scores a sorted-set member.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zadd(&mut self, key: &str, member: &str, score: i64) -> Result<bool> {
        self.touch(key);
        self.keyspace.zadd(key, member, score, self.now_ms)
    }

    /// Removes a sorted-set member.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zrem(&mut self, key: &str, member: &str) -> Result<bool> {
        self.touch(key);
        self.keyspace.zrem(key, member, self.now_ms)
    }

    /// Returns a member's score.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        self.keyspace.zscore(key, member, self.now_ms)
    }

    /// Number of sorted-set members.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zcard(&self, key: &str) -> Result<usize> {
        self.keyspace.zcard(key, self.now_ms)
    }

    /// Counts members with `min <= score <= max`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zcount(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        self.keyspace.zcount(key, min, max, self.now_ms)
    }

    /// Members with `min <= score <= max`, lowest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>> {
        self.keyspace
            .zrange_by_score(key, min, max, limit, self.now_ms)
    }

    /// The lowest-scored member.
    ///
    /// # Errors
    ///
    /// Returns an error if the key holds another type.
    pub fn zmin(&self, key: &str) -> Result<Option<(String, i64)>> {
        self.keyspace.zmin(key, self.now_ms)
    }
}

/// Runs `script` against `keyspace` and encodes its reply.
pub(crate) fn run(
    keyspace: &mut Keyspace,
    script: &Script,
    keys: &[String],
    args: &[String],
    now_ms: i64,
    now_ns: i64,
) -> Result<String> {
    let mut ctx = ScriptContext::new(keyspace, now_ms, now_ns);
    match (script.body)(&mut ctx, keys, args) {
        Ok(reply) => Ok(encode_reply(reply)?),
        Err(err) => {
            ctx.rollback();
            Err(match err {
                Error::Script { .. } => err,
                other => Error::script(script.name, other.to_string()),
            })
        }
    }
}

/// Serializes a reply, encoding empty arrays as empty objects.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode_reply(reply: serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(&objectify_empty_arrays(reply))?)
}

fn objectify_empty_arrays(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Array(items) if items.is_empty() => Value::Object(serde_json::Map::new()),
        Value::Array(items) => Value::Array(items.into_iter().map(objectify_empty_arrays).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, objectify_empty_arrays(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const NOW_MS: i64 = 1_700_000_000_000;

    fn failing(ctx: &mut ScriptContext<'_>, keys: &[String], _: &[String]) -> Result<serde_json::Value> {
        ctx.set(&keys[0], "written", None);
        ctx.zadd(&keys[1], "m", 1)?;
        Err(Error::script("failing", "boom"))
    }

    fn counter(ctx: &mut ScriptContext<'_>, keys: &[String], _: &[String]) -> Result<serde_json::Value> {
        let n = ctx.get_i64(&keys[0])?.unwrap_or(0) + 1;
        ctx.set(&keys[0], n.to_string(), None);
        Ok(json!({ "n": n, "l": [] }))
    }

    #[test]
    fn failed_script_leaves_no_writes() {
        let mut ks = Keyspace::new();
        ks.set("b", b"before".to_vec(), None, NOW_MS);
        let keys = vec!["a".to_string(), "b".to_string()];

        let err = run(&mut ks, &Script::new("failing", failing), &keys, &[], NOW_MS, 0)
            .unwrap_err();
        assert!(matches!(err, Error::Script { .. }));
        assert!(!ks.exists("a", NOW_MS));
        assert_eq!(ks.get("b", NOW_MS).unwrap(), Some(b"before".to_vec()));
    }

    #[test]
    fn store_errors_surface_as_script_errors() {
        let mut ks = Keyspace::new();
        ks.zadd("a", "m", 1, NOW_MS).unwrap();
        let keys = vec!["a".to_string()];
        let err = run(&mut ks, &Script::new("counter", counter), &keys, &[], NOW_MS, 0)
            .unwrap_err();
        match err {
            Error::Script { script, .. } => assert_eq!(script, "counter"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_arrays_are_encoded_as_objects() {
        let mut ks = Keyspace::new();
        let keys = vec!["a".to_string()];
        let reply = run(&mut ks, &Script::new("counter", counter), &keys, &[], NOW_MS, 0).unwrap();
        assert_eq!(reply, r#"{"l":{},"n":1}"#);
    }

    #[test]
    fn nested_arrays_keep_their_items() {
        let encoded = encode_reply(json!({ "x": [[], [1]] })).unwrap();
        assert_eq!(encoded, r#"{"x":[{},[1]]}"#);
    }
}
