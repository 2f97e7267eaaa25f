//! Property tests for the canonical constraint order.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use capgate_core::constraint::ConcurrencyMode;
use capgate_core::{
    AccountId, ConstraintConfig, ConstraintItem, EnvId, FunctionId, Scope, constraint_fingerprint,
    sort_constraints,
};
use proptest::prelude::*;

fn arb_scope() -> impl Strategy<Value = Scope> {
    prop::sample::select(vec![Scope::Account, Scope::Env, Scope::Function])
}

fn arb_hash() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), "[a-f0-9]{4}"]
}

fn arb_constraint() -> impl Strategy<Value = ConstraintItem> {
    prop_oneof![
        (arb_scope(), arb_hash()).prop_map(|(scope, hash)| ConstraintItem::rate_limit(scope, hash, "k")),
        (arb_scope(), arb_hash()).prop_map(|(scope, hash)| ConstraintItem::throttle(scope, hash, "k")),
        (arb_scope(), prop::bool::ANY).prop_map(|(scope, run)| {
            let mode = if run { ConcurrencyMode::Run } else { ConcurrencyMode::Step };
            ConstraintItem::concurrency(mode, scope)
        }),
    ]
}

proptest! {
    /// INVARIANT: sorting is idempotent and ignores input order.
    #[test]
    fn sort_is_canonical(
        items in prop::collection::vec(arb_constraint(), 0..8),
        seed in any::<u64>(),
    ) {
        let mut sorted = items.clone();
        sort_constraints(&mut sorted);

        let mut again = sorted.clone();
        sort_constraints(&mut again);
        prop_assert_eq!(&again, &sorted);

        let mut shuffled = items;
        let len = shuffled.len().max(1);
        let offset = usize::try_from(seed % u64::try_from(len).unwrap()).unwrap();
        shuffled.rotate_left(offset);
        shuffled.reverse();
        sort_constraints(&mut shuffled);
        prop_assert_eq!(&shuffled, &sorted);

        for pair in sorted.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }

    /// INVARIANT: the fingerprint does not depend on constraint order.
    #[test]
    fn fingerprint_ignores_order(items in prop::collection::vec(arb_constraint(), 1..6)) {
        let (account, env, function) = (AccountId::generate(), EnvId::generate(), FunctionId::generate());
        let config = ConstraintConfig { function_version: 1, ..ConstraintConfig::default() };

        let mut reversed = items.clone();
        reversed.reverse();
        prop_assert_eq!(
            constraint_fingerprint(account, env, function, &config, &items),
            constraint_fingerprint(account, env, function, &config, &reversed)
        );
    }
}
