//! Stable fingerprints over constraint sets.
//!
//! The fingerprint covers the sorted constraint list, the caller identity and
//! the slice of configuration each constraint resolves to. Two requests with
//! the same fingerprint compete for exactly the same capacity.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::constraint::{ConstraintItem, Scope};
use crate::constraint_config::ConstraintConfig;
use crate::id::{AccountId, EnvId, FunctionId};

#[derive(Serialize)]
struct FingerprintInput<'a> {
    a: AccountId,
    e: EnvId,
    f: FunctionId,
    c: Vec<FingerprintEntry<'a>>,
}

#[derive(Serialize)]
struct FingerprintEntry<'a> {
    i: &'a ConstraintItem,
    /// Resolved ceiling: limit, burst, period.
    l: (u32, u32, u32),
}

fn resolved_slice(config: &ConstraintConfig, item: &ConstraintItem) -> (u32, u32, u32) {
    match item {
        ConstraintItem::Concurrency(c) => (config.concurrency_limit(c), 0, 0),
        ConstraintItem::Throttle(t) => config
            .throttle_for(t)
            .map_or((0, 0, 0), |t| (t.limit, t.burst, t.period_secs)),
        ConstraintItem::RateLimit(r) => config
            .rate_limit_for(r)
            .map_or((0, 0, 0), |r| (r.limit, r.burst(), r.period_secs)),
    }
}

/// Computes the hex fingerprint of a constraint set.
///
/// Input order does not matter; constraints are sorted first.
#[must_use]
pub fn constraint_fingerprint(
    account: AccountId,
    env: EnvId,
    function: FunctionId,
    config: &ConstraintConfig,
    constraints: &[ConstraintItem],
) -> String {
    let mut sorted: Vec<&ConstraintItem> = constraints.iter().collect();
    sorted.sort();

    let input = FingerprintInput {
        a: account,
        e: env,
        f: function,
        c: sorted
            .into_iter()
            .map(|i| FingerprintEntry {
                i,
                l: resolved_slice(config, i),
            })
            .collect(),
    };

    // Serializing plain structs with derived impls cannot fail.
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Returns the admission-cache key of a single constraint.
///
/// Scope-default concurrency keys read `acq:<scope>:<entity>`, e.g.
/// `acq:a:<account>`. Other kinds carry a kind marker (`t`, `r`) and custom
/// keys append `<exprHash:evalHash>`.
#[must_use]
pub fn admission_cache_key(
    item: &ConstraintItem,
    account: AccountId,
    env: EnvId,
    function: FunctionId,
) -> String {
    let entity = match item.scope() {
        Scope::Account => account.to_string(),
        Scope::Env => env.to_string(),
        Scope::Function => function.to_string(),
    };
    let tag = item.scope().tag();

    let mut key = match item {
        ConstraintItem::Concurrency(_) => format!("acq:{tag}:{entity}"),
        ConstraintItem::Throttle(t) => {
            format!("acq:t:{tag}:{entity}:{}", t.evaluated_key_hash)
        }
        ConstraintItem::RateLimit(r) => {
            format!("acq:r:{tag}:{entity}:{}", r.evaluated_key_hash)
        }
    };
    if matches!(item, ConstraintItem::Concurrency(_)) && !item.key_expression_hash().is_empty() {
        key.push_str(&format!(
            "<{}:{}>",
            item.key_expression_hash(),
            item.evaluated_key_hash()
        ));
    }
    // Cache entries are per account even for env/function scopes.
    if item.scope() != Scope::Account {
        key.push_str(&format!("@{account}"));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConcurrencyMode;
    use crate::constraint_config::ConcurrencyConfig;

    fn ids() -> (AccountId, EnvId, FunctionId) {
        (AccountId::generate(), EnvId::generate(), FunctionId::generate())
    }

    #[test]
    fn fingerprint_ignores_input_order() {
        let (a, e, f) = ids();
        let config = ConstraintConfig::default();
        let x = ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account);
        let y = ConstraintItem::throttle(Scope::Function, "h", "v");
        let one = constraint_fingerprint(a, e, f, &config, &[x.clone(), y.clone()]);
        let two = constraint_fingerprint(a, e, f, &config, &[y, x]);
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_config_slice() {
        let (a, e, f) = ids();
        let item = ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account);
        let low = ConstraintConfig {
            function_version: 1,
            concurrency: ConcurrencyConfig {
                account_concurrency: 1,
                ..ConcurrencyConfig::default()
            },
            ..ConstraintConfig::default()
        };
        let mut high = low.clone();
        high.concurrency.account_concurrency = 2;
        assert_ne!(
            constraint_fingerprint(a, e, f, &low, std::slice::from_ref(&item)),
            constraint_fingerprint(a, e, f, &high, std::slice::from_ref(&item))
        );
    }

    #[test]
    fn fingerprint_changes_with_identity() {
        let (a, e, f) = ids();
        let config = ConstraintConfig::default();
        let item = [ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account)];
        assert_ne!(
            constraint_fingerprint(a, e, f, &config, &item),
            constraint_fingerprint(a, e, FunctionId::generate(), &config, &item)
        );
    }

    #[test]
    fn account_concurrency_cache_key() {
        let (a, e, f) = ids();
        let item = ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Account);
        assert_eq!(admission_cache_key(&item, a, e, f), format!("acq:a:{a}"));
    }

    #[test]
    fn function_concurrency_cache_key_is_account_scoped() {
        let (a, e, f) = ids();
        let item = ConstraintItem::concurrency(ConcurrencyMode::Step, Scope::Function);
        assert_eq!(admission_cache_key(&item, a, e, f), format!("acq:f:{f}@{a}"));
    }

    #[test]
    fn kind_markers_in_cache_keys() {
        let (a, e, f) = ids();
        let t = ConstraintItem::throttle(Scope::Account, "h", "v");
        let r = ConstraintItem::rate_limit(Scope::Account, "h", "v");
        assert!(admission_cache_key(&t, a, e, f).starts_with("acq:t:a:"));
        assert!(admission_cache_key(&r, a, e, f).starts_with("acq:r:a:"));
    }
}
