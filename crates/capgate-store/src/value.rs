//! Value types held by the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// The type of a stored key, as reported by `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Key does not exist.
    None,
    /// Binary string.
    String,
    /// Field/value hash.
    Hash,
    /// Sorted set.
    ZSet,
}

impl KeyType {
    /// Returns the lowercase type name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::String => "string",
            Self::Hash => "hash",
            Self::ZSet => "zset",
        }
    }
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Binary string.
    String(Vec<u8>),
    /// Field/value hash.
    Hash(BTreeMap<String, String>),
    /// Sorted set.
    ZSet(SortedSet),
}

impl Value {
    /// Returns the key type of this value.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::String(_) => KeyType::String,
            Self::Hash(_) => KeyType::Hash,
            Self::ZSet(_) => KeyType::ZSet,
        }
    }

    pub(crate) fn is_empty_container(&self) -> bool {
        match self {
            Self::String(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::ZSet(z) => z.is_empty(),
        }
    }
}

/// A set of members ordered by integer score, ties broken by member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, i64)>", into = "Vec<(String, i64)>")]
pub struct SortedSet {
    by_member: HashMap<String, i64>,
    by_score: BTreeSet<(i64, String)>,
}

impl SortedSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_member.len()
    }

    /// Returns true when the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_member.is_empty()
    }

    /// Inserts or re-scores a member. Returns true when the member is new.
    pub fn insert(&mut self, member: impl Into<String>, score: i64) -> bool {
        let member = member.into();
        let previous = self.by_member.insert(member.clone(), score);
        if let Some(old) = previous {
            self.by_score.remove(&(old, member.clone()));
        }
        self.by_score.insert((score, member));
        previous.is_none()
    }

    /// Removes a member. Returns true when it was present.
    pub fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => {
                self.by_score.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    /// Returns the score of a member.
    #[must_use]
    pub fn score(&self, member: &str) -> Option<i64> {
        self.by_member.get(member).copied()
    }

    /// Returns the lowest-scored member.
    #[must_use]
    pub fn first(&self) -> Option<(&str, i64)> {
        self.by_score.iter().next().map(|(s, m)| (m.as_str(), *s))
    }

    /// Members with `min <= score <= max`, lowest first, at most `limit`.
    #[must_use]
    pub fn range_by_score(&self, min: i64, max: i64, limit: Option<usize>) -> Vec<(String, i64)> {
        if min > max {
            return Vec::new();
        }
        let iter = self
            .by_score
            .range((min, String::new())..)
            .take_while(|(s, _)| *s <= max)
            .map(|(s, m)| (m.clone(), *s));
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Counts members with `min <= score <= max`.
    #[must_use]
    pub fn count_by_score(&self, min: i64, max: i64) -> usize {
        if min > max {
            return 0;
        }
        self.by_score
            .range((min, String::new())..)
            .take_while(|(s, _)| *s <= max)
            .count()
    }

    /// Iterates members lowest score first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.by_score.iter().map(|(s, m)| (m.as_str(), *s))
    }
}

impl From<Vec<(String, i64)>> for SortedSet {
    fn from(members: Vec<(String, i64)>) -> Self {
        let mut set = Self::new();
        for (member, score) in members {
            set.insert(member, score);
        }
        set
    }
}

impl From<SortedSet> for Vec<(String, i64)> {
    fn from(set: SortedSet) -> Self {
        set.by_score.into_iter().map(|(s, m)| (m, s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rescores_existing_member() {
        let mut set = SortedSet::new();
        assert!(set.insert("a", 10));
        assert!(!set.insert("a", 5));
        assert_eq!(set.len(), 1);
        assert_eq!(set.score("a"), Some(5));
        assert_eq!(set.first(), Some(("a", 5)));
    }

    #[test]
    fn range_is_inclusive_and_limited() {
        let mut set = SortedSet::new();
        for (m, s) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            set.insert(m, s);
        }
        let got: Vec<String> = set
            .range_by_score(2, 4, Some(2))
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(got, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(set.count_by_score(i64::MIN, 3), 3);
        assert!(set.range_by_score(5, 1, None).is_empty());
    }

    #[test]
    fn ties_order_by_member() {
        let mut set = SortedSet::new();
        set.insert("z", 1);
        set.insert("a", 1);
        let members: Vec<&str> = set.iter().map(|(m, _)| m).collect();
        assert_eq!(members, vec!["a", "z"]);
    }

    #[test]
    fn remove_reports_presence() {
        let mut set = SortedSet::new();
        set.insert("a", 1);
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert!(set.is_empty());
    }
}
