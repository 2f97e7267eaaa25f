//! The constraint data model.
//!
//! A [`ConstraintItem`] is what a caller submits with each operation: one of
//! a concurrency, throttle or rate-limit payload. The matching ceiling lives
//! in [`ConstraintConfig`](crate::constraint_config::ConstraintConfig).
//!
//! ## Wire form
//!
//! Constraints are embedded in script arguments and persisted records, so
//! they serialize compactly: short field names and integer enums.
//!
//! | Enum | Values |
//! |------|--------|
//! | [`ConstraintKind`] | `RateLimit = 1`, `Concurrency = 2`, `Throttle = 3` |
//! | [`Scope`] | `Function = 0`, `Env = 1`, `Account = 2` |
//! | [`ConcurrencyMode`] | `Step = 0`, `Run = 1` |
//!
//! ## Ordering
//!
//! [`ConstraintItem`] has a total order used wherever replay or hashing
//! must be stable: rate limit < throttle < concurrency, then scope
//! account < env < function, then constraints without a key expression
//! before those with one, then lexicographic by hashes.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The family a constraint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConstraintKind {
    /// Hard requests-per-period limit (nanosecond resolution).
    RateLimit,
    /// Items-in-flight ceiling.
    Concurrency,
    /// Smoothed requests-per-period with burst (millisecond resolution).
    Throttle,
}

impl ConstraintKind {
    /// Returns the stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Concurrency => "concurrency",
            Self::Throttle => "throttle",
        }
    }

    const fn sort_rank(self) -> u8 {
        match self {
            Self::RateLimit => 0,
            Self::Throttle => 1,
            Self::Concurrency => 2,
        }
    }
}

impl From<ConstraintKind> for u8 {
    fn from(kind: ConstraintKind) -> Self {
        match kind {
            ConstraintKind::RateLimit => 1,
            ConstraintKind::Concurrency => 2,
            ConstraintKind::Throttle => 3,
        }
    }
}

impl TryFrom<u8> for ConstraintKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RateLimit),
            2 => Ok(Self::Concurrency),
            3 => Ok(Self::Throttle),
            other => Err(Error::InvalidInput(format!(
                "unknown constraint kind {other}"
            ))),
        }
    }
}

/// The granularity a constraint applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Scope {
    /// One function.
    Function,
    /// One environment.
    Env,
    /// The whole account.
    Account,
}

impl Scope {
    /// Returns the one-letter tag used inside state keys.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Function => "f",
            Self::Env => "e",
            Self::Account => "a",
        }
    }

    /// Returns the stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Env => "env",
            Self::Account => "account",
        }
    }

    const fn sort_rank(self) -> u8 {
        match self {
            Self::Account => 0,
            Self::Env => 1,
            Self::Function => 2,
        }
    }
}

impl From<Scope> for u8 {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Function => 0,
            Scope::Env => 1,
            Scope::Account => 2,
        }
    }
}

impl TryFrom<u8> for Scope {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Function),
            1 => Ok(Self::Env),
            2 => Ok(Self::Account),
            other => Err(Error::InvalidInput(format!("unknown scope {other}"))),
        }
    }
}

/// Whether a concurrency constraint counts steps or whole runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConcurrencyMode {
    /// Each executing step holds a slot.
    #[default]
    Step,
    /// Each in-progress run holds a slot.
    Run,
}

impl From<ConcurrencyMode> for u8 {
    fn from(mode: ConcurrencyMode) -> Self {
        match mode {
            ConcurrencyMode::Step => 0,
            ConcurrencyMode::Run => 1,
        }
    }
}

impl TryFrom<u8> for ConcurrencyMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Step),
            1 => Ok(Self::Run),
            other => Err(Error::InvalidInput(format!(
                "unknown concurrency mode {other}"
            ))),
        }
    }
}

/// A concurrency constraint.
///
/// A non-empty `key_expression_hash` makes this a *custom key* constraint;
/// the evaluated hash then selects the concrete key within that expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyConstraint {
    /// Step or run mode.
    #[serde(rename = "m", default)]
    pub mode: ConcurrencyMode,
    /// Scope the ceiling applies at.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Hash of the custom key expression, empty for the scope default.
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    /// Hash of the evaluated custom key, empty for the scope default.
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
    /// Caller-owned sorted set of items already in flight for this constraint.
    #[serde(rename = "iik", default, skip_serializing_if = "String::is_empty")]
    pub in_progress_item_key: String,
}

impl ConcurrencyConstraint {
    /// Creates a scope-default concurrency constraint.
    #[must_use]
    pub fn new(mode: ConcurrencyMode, scope: Scope) -> Self {
        Self {
            mode,
            scope,
            key_expression_hash: String::new(),
            evaluated_key_hash: String::new(),
            in_progress_item_key: String::new(),
        }
    }

    /// Refines the constraint with a custom key.
    #[must_use]
    pub fn with_custom_key(
        mut self,
        key_expression_hash: impl Into<String>,
        evaluated_key_hash: impl Into<String>,
    ) -> Self {
        self.key_expression_hash = key_expression_hash.into();
        self.evaluated_key_hash = evaluated_key_hash.into();
        self
    }

    /// Sets the caller-owned in-flight item set.
    #[must_use]
    pub fn with_in_progress_items(mut self, key: impl Into<String>) -> Self {
        self.in_progress_item_key = key.into();
        self
    }

    /// Returns true when this constraint uses a custom key expression.
    #[must_use]
    pub fn is_custom_key(&self) -> bool {
        !self.key_expression_hash.is_empty()
    }
}

/// A throttle constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThrottleConstraint {
    /// Scope the throttle applies at.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Hash of the throttle key expression.
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    /// Hash of the evaluated throttle key.
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
}

/// A rate-limit constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitConstraint {
    /// Scope the rate limit applies at.
    #[serde(rename = "s")]
    pub scope: Scope,
    /// Hash of the rate-limit key expression.
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    /// Hash of the evaluated rate-limit key.
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
}

/// One constraint submitted with an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireConstraintItem", into = "WireConstraintItem")]
pub enum ConstraintItem {
    /// A rate limit.
    RateLimit(RateLimitConstraint),
    /// A throttle.
    Throttle(ThrottleConstraint),
    /// A concurrency ceiling.
    Concurrency(ConcurrencyConstraint),
}

impl ConstraintItem {
    /// Shorthand for a scope-default concurrency constraint.
    #[must_use]
    pub fn concurrency(mode: ConcurrencyMode, scope: Scope) -> Self {
        Self::Concurrency(ConcurrencyConstraint::new(mode, scope))
    }

    /// Shorthand for a throttle constraint.
    #[must_use]
    pub fn throttle(
        scope: Scope,
        key_expression_hash: impl Into<String>,
        evaluated_key_hash: impl Into<String>,
    ) -> Self {
        Self::Throttle(ThrottleConstraint {
            scope,
            key_expression_hash: key_expression_hash.into(),
            evaluated_key_hash: evaluated_key_hash.into(),
        })
    }

    /// Shorthand for a rate-limit constraint.
    #[must_use]
    pub fn rate_limit(
        scope: Scope,
        key_expression_hash: impl Into<String>,
        evaluated_key_hash: impl Into<String>,
    ) -> Self {
        Self::RateLimit(RateLimitConstraint {
            scope,
            key_expression_hash: key_expression_hash.into(),
            evaluated_key_hash: evaluated_key_hash.into(),
        })
    }

    /// Returns the constraint family.
    #[must_use]
    pub const fn kind(&self) -> ConstraintKind {
        match self {
            Self::RateLimit(_) => ConstraintKind::RateLimit,
            Self::Throttle(_) => ConstraintKind::Throttle,
            Self::Concurrency(_) => ConstraintKind::Concurrency,
        }
    }

    /// Returns the scope the constraint applies at.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        match self {
            Self::RateLimit(c) => c.scope,
            Self::Throttle(c) => c.scope,
            Self::Concurrency(c) => c.scope,
        }
    }

    /// Returns the key expression hash (empty when none).
    #[must_use]
    pub fn key_expression_hash(&self) -> &str {
        match self {
            Self::RateLimit(c) => &c.key_expression_hash,
            Self::Throttle(c) => &c.key_expression_hash,
            Self::Concurrency(c) => &c.key_expression_hash,
        }
    }

    /// Returns the evaluated key hash (empty when none).
    #[must_use]
    pub fn evaluated_key_hash(&self) -> &str {
        match self {
            Self::RateLimit(c) => &c.evaluated_key_hash,
            Self::Throttle(c) => &c.evaluated_key_hash,
            Self::Concurrency(c) => &c.evaluated_key_hash,
        }
    }

    fn tie_break(&self) -> (u8, &str) {
        match self {
            Self::Concurrency(c) => (u8::from(c.mode), c.in_progress_item_key.as_str()),
            Self::RateLimit(_) | Self::Throttle(_) => (0, ""),
        }
    }
}

impl Ord for ConstraintItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind()
            .sort_rank()
            .cmp(&other.kind().sort_rank())
            .then_with(|| self.scope().sort_rank().cmp(&other.scope().sort_rank()))
            .then_with(|| {
                // Empty expression hashes sort first.
                (!self.key_expression_hash().is_empty())
                    .cmp(&!other.key_expression_hash().is_empty())
            })
            .then_with(|| self.key_expression_hash().cmp(other.key_expression_hash()))
            .then_with(|| self.evaluated_key_hash().cmp(other.evaluated_key_hash()))
            .then_with(|| self.tie_break().cmp(&other.tie_break()))
    }
}

impl PartialOrd for ConstraintItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConstraintItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.scope().as_str())?;
        if !self.key_expression_hash().is_empty() {
            write!(
                f,
                "<{}:{}>",
                self.key_expression_hash(),
                self.evaluated_key_hash()
            )?;
        }
        Ok(())
    }
}

/// Sorts constraints into their canonical order.
pub fn sort_constraints(constraints: &mut [ConstraintItem]) {
    constraints.sort();
}

#[derive(Serialize, Deserialize)]
struct WireConstraintItem {
    k: ConstraintKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    c: Option<ConcurrencyConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<ThrottleConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r: Option<RateLimitConstraint>,
}

impl From<ConstraintItem> for WireConstraintItem {
    fn from(item: ConstraintItem) -> Self {
        let kind = item.kind();
        let mut wire = Self {
            k: kind,
            c: None,
            t: None,
            r: None,
        };
        match item {
            ConstraintItem::Concurrency(c) => wire.c = Some(c),
            ConstraintItem::Throttle(t) => wire.t = Some(t),
            ConstraintItem::RateLimit(r) => wire.r = Some(r),
        }
        wire
    }
}

impl TryFrom<WireConstraintItem> for ConstraintItem {
    type Error = Error;

    fn try_from(wire: WireConstraintItem) -> Result<Self, Self::Error> {
        let missing = |field: &str| {
            Error::InvalidInput(format!(
                "constraint of kind {} is missing its '{field}' payload",
                wire.k.as_str()
            ))
        };
        match wire.k {
            ConstraintKind::Concurrency => {
                wire.c.clone().map(Self::Concurrency).ok_or_else(|| missing("c"))
            }
            ConstraintKind::Throttle => wire.t.clone().map(Self::Throttle).ok_or_else(|| missing("t")),
            ConstraintKind::RateLimit => {
                wire.r.clone().map(Self::RateLimit).ok_or_else(|| missing("r"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(items: &[ConstraintItem]) -> Vec<ConstraintKind> {
        items.iter().map(ConstraintItem::kind).collect()
    }

    #[test]
    fn kinds_sort_rate_limit_throttle_concurrency() {
        let mut items = vec![
            ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Function),
            ConstraintItem::throttle(Scope::Function, "", ""),
            ConstraintItem::rate_limit(Scope::Function, "", ""),
        ];
        sort_constraints(&mut items);
        assert_eq!(
            kinds(&items),
            vec![
                ConstraintKind::RateLimit,
                ConstraintKind::Throttle,
                ConstraintKind::Concurrency
            ]
        );
    }

    #[test]
    fn scopes_sort_account_env_function() {
        let mut items = vec![
            ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Function),
            ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Env),
            ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account),
        ];
        sort_constraints(&mut items);
        let scopes: Vec<Scope> = items.iter().map(ConstraintItem::scope).collect();
        assert_eq!(scopes, vec![Scope::Account, Scope::Env, Scope::Function]);
    }

    #[test]
    fn empty_expression_hash_sorts_first() {
        let custom = ConstraintItem::Concurrency(
            ConcurrencyConstraint::new(ConcurrencyMode::Step, Scope::Function)
                .with_custom_key("aaa", "x"),
        );
        let plain = ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Function);
        let mut items = vec![custom.clone(), plain.clone()];
        sort_constraints(&mut items);
        assert_eq!(items, vec![plain, custom]);
    }

    #[test]
    fn expression_hashes_sort_lexicographically() {
        let b = ConstraintItem::throttle(Scope::Account, "bbb", "1");
        let a = ConstraintItem::throttle(Scope::Account, "aaa", "2");
        let mut items = vec![b.clone(), a.clone()];
        sort_constraints(&mut items);
        assert_eq!(items, vec![a, b]);
    }

    #[test]
    fn wire_form_uses_short_names_and_integers() {
        let item = ConstraintItem::Concurrency(
            ConcurrencyConstraint::new(ConcurrencyMode::Run, Scope::Account)
                .with_custom_key("expr", "eval"),
        );
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"k":2,"c":{"m":1,"s":2,"h":"expr","eh":"eval"}}"#);

        let back: ConstraintItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn wire_form_rejects_missing_payload() {
        let err = serde_json::from_str::<ConstraintItem>(r#"{"k":3}"#).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn wire_form_rejects_unknown_kind() {
        assert!(serde_json::from_str::<ConstraintItem>(r#"{"k":9}"#).is_err());
    }

    #[test]
    fn display_includes_custom_key() {
        let item = ConstraintItem::throttle(Scope::Env, "h", "e");
        assert_eq!(item.to_string(), "throttle:env<h:e>");
    }
}
