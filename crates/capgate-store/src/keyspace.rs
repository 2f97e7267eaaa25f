//! The keyspace of one shard.
//!
//! Keys expire lazily: an entry past its deadline is treated as absent by
//! every read and removed by the next write or scan that touches it. All
//! methods take the current time in unix milliseconds so scripts observe a
//! single instant for their whole execution.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{KeyType, SortedSet, Value};

const DUMP_MAGIC: &[u8; 4] = b"CGD1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}

#[derive(Serialize, Deserialize)]
struct DumpBody {
    value: Value,
}

/// All keys of one shard.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Creates an empty keyspace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str, now_ms: i64) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now_ms))
    }

    fn live_mut(&mut self, key: &str, now_ms: i64) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now_ms)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_container())
        {
            self.entries.remove(key);
        }
    }

    pub(crate) fn snapshot(&self, key: &str) -> Option<Entry> {
        self.entries.get(key).cloned()
    }

    pub(crate) fn restore_snapshot(&mut self, key: &str, entry: Option<Entry>) {
        match entry {
            Some(entry) => {
                self.entries.insert(key.to_string(), entry);
            }
            None => {
                self.entries.remove(key);
            }
        }
    }

    /// Returns true when the key exists.
    #[must_use]
    pub fn exists(&self, key: &str, now_ms: i64) -> bool {
        self.live(key, now_ms).is_some()
    }

    /// Returns the type of the value at `key`.
    #[must_use]
    pub fn key_type(&self, key: &str, now_ms: i64) -> KeyType {
        self.live(key, now_ms)
            .map_or(KeyType::None, |e| e.value.key_type())
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self, now_ms: i64) -> usize {
        self.entries.values().filter(|e| e.is_live(now_ms)).count()
    }

    /// Returns true when no live key exists.
    #[must_use]
    pub fn is_empty(&self, now_ms: i64) -> bool {
        self.len(now_ms) == 0
    }

    // ------------------------------------------------------------------
    // Generic
    // ------------------------------------------------------------------

    /// Deletes a key. Returns true when it existed.
    pub fn del(&mut self, key: &str, now_ms: i64) -> bool {
        self.live_mut(key, now_ms).is_some() && self.entries.remove(key).is_some()
    }

    /// Sets a TTL in milliseconds. Returns true when the key exists.
    pub fn pexpire(&mut self, key: &str, ttl_ms: i64, now_ms: i64) -> bool {
        if ttl_ms <= 0 {
            return self.del(key, now_ms);
        }
        match self.live_mut(key, now_ms) {
            Some(entry) => {
                entry.expires_at_ms = Some(now_ms.saturating_add(ttl_ms));
                true
            }
            None => false,
        }
    }

    /// Remaining TTL in milliseconds: `-2` if missing, `-1` if persistent.
    #[must_use]
    pub fn pttl(&self, key: &str, now_ms: i64) -> i64 {
        match self.live(key, now_ms) {
            None => -2,
            Some(Entry {
                expires_at_ms: None,
                ..
            }) => -1,
            Some(Entry {
                expires_at_ms: Some(at),
                ..
            }) => at - now_ms,
        }
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Reads a string value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-string.
    pub fn get(&self, key: &str, now_ms: i64) -> Result<Option<Vec<u8>>> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Writes a string value, replacing any previous value and TTL.
    pub fn set(&mut self, key: &str, value: Vec<u8>, ttl_ms: Option<i64>, now_ms: i64) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::String(value),
                expires_at_ms: ttl_ms.map(|ttl| now_ms.saturating_add(ttl)),
            },
        );
    }

    // ------------------------------------------------------------------
    // Hashes
    // ------------------------------------------------------------------

    fn hash(&self, key: &str, now_ms: i64) -> Result<Option<&BTreeMap<String, String>>> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Reads one hash field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-hash.
    pub fn hget(&self, key: &str, field: &str, now_ms: i64) -> Result<Option<String>> {
        Ok(self.hash(key, now_ms)?.and_then(|h| h.get(field).cloned()))
    }

    /// Reads every hash field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-hash.
    pub fn hgetall(&self, key: &str, now_ms: i64) -> Result<BTreeMap<String, String>> {
        Ok(self.hash(key, now_ms)?.cloned().unwrap_or_default())
    }

    /// Sets hash fields. Returns the number of new fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-hash.
    pub fn hset<I>(&mut self, key: &str, fields: I, now_ms: i64) -> Result<usize>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let entry = self
            .live_mut(key, now_ms)
            .map(|e| matches!(e.value, Value::Hash(_)));
        if entry == Some(false) {
            return Err(wrong_type(key));
        }
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(BTreeMap::new()),
            expires_at_ms: None,
        });
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let mut added = 0;
        for (field, value) in fields {
            if hash.insert(field, value).is_none() {
                added += 1;
            }
        }
        self.drop_if_empty(key);
        Ok(added)
    }

    /// Deletes a hash field. Returns true when it existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-hash.
    pub fn hdel(&mut self, key: &str, field: &str, now_ms: i64) -> Result<bool> {
        let removed = match self.live_mut(key, now_ms) {
            None => false,
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => h.remove(field).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Sorted sets
    // ------------------------------------------------------------------

    fn zset(&self, key: &str, now_ms: i64) -> Result<Option<&SortedSet>> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Adds or re-scores a member. Returns true when the member is new.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zadd(&mut self, key: &str, member: &str, score: i64, now_ms: i64) -> Result<bool> {
        if let Some(entry) = self.live_mut(key, now_ms) {
            let Value::ZSet(set) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            return Ok(set.insert(member, score));
        }
        let mut set = SortedSet::new();
        set.insert(member, score);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::ZSet(set),
                expires_at_ms: None,
            },
        );
        Ok(true)
    }

    /// Removes a member. Returns true when it was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zrem(&mut self, key: &str, member: &str, now_ms: i64) -> Result<bool> {
        let removed = match self.live_mut(key, now_ms) {
            None => false,
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => z.remove(member),
            Some(_) => return Err(wrong_type(key)),
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// Returns a member's score.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zscore(&self, key: &str, member: &str, now_ms: i64) -> Result<Option<i64>> {
        Ok(self.zset(key, now_ms)?.and_then(|z| z.score(member)))
    }

    /// Returns the number of members.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zcard(&self, key: &str, now_ms: i64) -> Result<usize> {
        Ok(self.zset(key, now_ms)?.map_or(0, SortedSet::len))
    }

    /// Counts members with `min <= score <= max`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zcount(&self, key: &str, min: i64, max: i64, now_ms: i64) -> Result<usize> {
        Ok(self
            .zset(key, now_ms)?
            .map_or(0, |z| z.count_by_score(min, max)))
    }

    /// Members with `min <= score <= max`, lowest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
        now_ms: i64,
    ) -> Result<Vec<(String, i64)>> {
        Ok(self
            .zset(key, now_ms)?
            .map(|z| z.range_by_score(min, max, limit))
            .unwrap_or_default())
    }

    /// The lowest-scored member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongType`] if the key holds a non-zset.
    pub fn zmin(&self, key: &str, now_ms: i64) -> Result<Option<(String, i64)>> {
        Ok(self
            .zset(key, now_ms)?
            .and_then(|z| z.first().map(|(m, s)| (m.to_string(), s))))
    }

    // ------------------------------------------------------------------
    // Keyspace iteration and migration
    // ------------------------------------------------------------------

    /// Removes every expired entry.
    pub fn purge_expired(&mut self, now_ms: i64) {
        self.entries.retain(|_, e| e.is_live(now_ms));
    }

    /// Incrementally iterates keys matching a glob `pattern`.
    ///
    /// The cursor orders keys by CRC-32 of the key name, so a key present for
    /// the entire iteration is returned at least once even while other keys
    /// are added or removed. A returned cursor of `0` ends the iteration.
    #[must_use]
    pub fn scan(&self, cursor: u64, pattern: &str, count: usize, now_ms: i64) -> (u64, Vec<String>) {
        let start = cursor.saturating_sub(1);
        let mut candidates: Vec<(u64, &str)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_live(now_ms))
            .map(|(k, _)| (u64::from(crc32fast::hash(k.as_bytes())), k.as_str()))
            .filter(|(h, _)| *h >= start)
            .collect();
        candidates.sort_unstable();

        let count = count.max(1);
        let mut out = Vec::new();
        let mut taken = 0;
        let mut next = 0;
        let mut last_hash = None;
        for (hash, key) in candidates {
            // Never split one hash bucket across two calls.
            if taken >= count && last_hash != Some(hash) {
                next = hash + 1;
                break;
            }
            taken += 1;
            last_hash = Some(hash);
            if glob_match(pattern.as_bytes(), key.as_bytes()) {
                out.push(key.to_string());
            }
        }
        (next, out)
    }

    /// Serializes the value at `key` (without its TTL).
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn dump(&self, key: &str, now_ms: i64) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.live(key, now_ms) else {
            return Ok(None);
        };
        let body = serde_json::to_vec(&DumpBody {
            value: entry.value.clone(),
        })?;
        let mut payload = Vec::with_capacity(body.len() + 8);
        payload.extend_from_slice(DUMP_MAGIC);
        payload.extend_from_slice(&body);
        payload.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(Some(payload))
    }

    /// Recreates a key from a [`dump`](Self::dump) payload.
    ///
    /// `ttl_ms` of zero creates a persistent key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusyKey`] if the key exists and `replace` is false,
    /// or [`Error::InvalidDump`] if the payload is corrupt.
    pub fn restore(
        &mut self,
        key: &str,
        ttl_ms: i64,
        payload: &[u8],
        replace: bool,
        now_ms: i64,
    ) -> Result<()> {
        if !replace && self.live_mut(key, now_ms).is_some() {
            return Err(Error::BusyKey {
                key: key.to_string(),
            });
        }
        let value = decode_dump(payload)?;
        let expires_at_ms = (ttl_ms > 0).then(|| now_ms.saturating_add(ttl_ms));
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }
}

fn decode_dump(payload: &[u8]) -> Result<Value> {
    let invalid = |message: &str| Error::InvalidDump {
        message: message.to_string(),
    };
    if payload.len() < DUMP_MAGIC.len() + 4 || !payload.starts_with(DUMP_MAGIC) {
        return Err(invalid("missing header"));
    }
    let (body, checksum) = payload[DUMP_MAGIC.len()..].split_at(payload.len() - DUMP_MAGIC.len() - 4);
    let expected = u32::from_le_bytes(
        checksum
            .try_into()
            .map_err(|_| invalid("truncated checksum"))?,
    );
    if crc32fast::hash(body) != expected {
        return Err(invalid("checksum mismatch"));
    }
    let decoded: DumpBody =
        serde_json::from_slice(body).map_err(|e| invalid(&format!("undecodable body: {e}")))?;
    Ok(decoded.value)
}

fn wrong_type(key: &str) -> Error {
    Error::WrongType {
        key: key.to_string(),
    }
}

/// Glob matching with `*`, `?` and `\` escapes.
#[must_use]
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == b'*')
}
