//! Deterministic naming of backing-store keys.
//!
//! Every key an atomic operation touches for an account shares the hash tag
//! `{prefix:account}` so a sharded deployment co-locates them. The hash tag
//! is what places a key with its account; the key body only says which kind
//! of state it holds and, for scoped constraint keys, which entity.
//!
//! | Purpose | Shape |
//! |---------|-------|
//! | Lease record | `{prefix:account}:ld:<leaseId>` |
//! | Account lease index | `{prefix:account}:leaseq` |
//! | Request state | `{prefix:account}:rs:<requestId>` |
//! | Operation idempotency | `{prefix:account}:ik:<op>:<sha256(key)>` |
//! | Concurrency lease set | `{prefix:account}:concurrency:<scope>:<entity>[<exprHash:evalHash>]` |
//! | Throttle TAT | `{prefix:account}:throttle[:<scope>:<entity>]:<evalHash>` |
//! | Rate-limit TAT | `{prefix:account}:rl[:<scope>:<entity>]:<evalHash>` |
//! | Scavenger shard | `{prefix}:scav:<shard>` |
//!
//! Function-scoped throttle and rate-limit keys omit the scope segment: the
//! evaluated hash already identifies the function.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constraint::{ConcurrencyConstraint, RateLimitConstraint, Scope, ThrottleConstraint};
use crate::id::{AccountId, EnvId, FunctionId, LeaseId, RequestId};

/// Operations that memoize their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyOp {
    /// Acquire.
    Acquire,
    /// Check.
    Check,
    /// Extend lease.
    Extend,
    /// Release.
    Release,
}

impl IdempotencyOp {
    /// Returns the key segment for the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acquire => "acq",
            Self::Check => "chk",
            Self::Extend => "ext",
            Self::Release => "rel",
        }
    }
}

/// Returns the hex SHA-256 of a caller-supplied idempotency key.
#[must_use]
pub fn hash_idempotency_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Returns the scavenger shard an account lives in.
///
/// Deterministic across processes: CRC-32 of the account ID string modulo the
/// shard count.
#[must_use]
pub fn scavenger_shard_index(account: AccountId, num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    crc32fast::hash(account.to_string().as_bytes()) % num_shards
}

/// The key prefix shared by all keys of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// Creates a key prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// Returns the raw prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key of scavenger shard `shard`.
    #[must_use]
    pub fn scavenger_shard(&self, shard: u32) -> String {
        format!("{{{}}}:scav:{shard}", self.0)
    }

    /// Returns the keys for one account.
    #[must_use]
    pub fn account(&self, account: AccountId) -> AccountKeys {
        AccountKeys {
            tag: format!("{{{}:{account}}}", self.0),
            account,
        }
    }
}

/// Key builder bound to one account's hash tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKeys {
    tag: String,
    account: AccountId,
}

impl AccountKeys {
    /// Returns the account these keys belong to.
    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        self.account
    }

    /// Returns the `{prefix:account}` hash tag.
    #[must_use]
    pub fn hash_tag(&self) -> &str {
        &self.tag
    }

    /// Lease record key.
    #[must_use]
    pub fn lease(&self, lease_id: &LeaseId) -> String {
        format!("{}:ld:{lease_id}", self.tag)
    }

    /// Prefix of lease record keys; scripts append the lease ID.
    #[must_use]
    pub fn lease_prefix(&self) -> String {
        format!("{}:ld:", self.tag)
    }

    /// Marker left behind when a lease is replaced by an extension.
    #[must_use]
    pub fn superseded(&self, lease_id: &LeaseId) -> String {
        format!("{}:sup:{lease_id}", self.tag)
    }

    /// Prefix of supersession markers; scripts append the lease ID.
    #[must_use]
    pub fn superseded_prefix(&self) -> String {
        format!("{}:sup:", self.tag)
    }

    /// Account lease index key.
    #[must_use]
    pub fn lease_index(&self) -> String {
        format!("{}:leaseq", self.tag)
    }

    /// Request state key.
    #[must_use]
    pub fn request_state(&self, request_id: &RequestId) -> String {
        format!("{}:rs:{request_id}", self.tag)
    }

    /// Prefix of request state keys; scripts append the request ID.
    #[must_use]
    pub fn request_state_prefix(&self) -> String {
        format!("{}:rs:", self.tag)
    }

    /// Operation idempotency record key.
    #[must_use]
    pub fn idempotency(&self, op: IdempotencyOp, caller_key: &str) -> String {
        format!(
            "{}:ik:{}:{}",
            self.tag,
            op.as_str(),
            hash_idempotency_key(caller_key)
        )
    }

    /// Lease set of a concurrency constraint.
    #[must_use]
    pub fn concurrency(
        &self,
        constraint: &ConcurrencyConstraint,
        env: EnvId,
        function: FunctionId,
    ) -> String {
        let entity = self.entity(constraint.scope, env, function);
        let mut key = format!(
            "{}:concurrency:{}:{entity}",
            self.tag,
            constraint.scope.tag()
        );
        if constraint.is_custom_key() {
            key.push_str(&format!(
                "<{}:{}>",
                constraint.key_expression_hash, constraint.evaluated_key_hash
            ));
        }
        key
    }

    /// Throttle TAT key.
    #[must_use]
    pub fn throttle(&self, constraint: &ThrottleConstraint, env: EnvId) -> String {
        self.gcra("throttle", constraint.scope, &constraint.evaluated_key_hash, env)
    }

    /// Rate-limit TAT key.
    #[must_use]
    pub fn rate_limit(&self, constraint: &RateLimitConstraint, env: EnvId) -> String {
        self.gcra("rl", constraint.scope, &constraint.evaluated_key_hash, env)
    }

    /// Scan patterns matching every GCRA key of the account.
    #[must_use]
    pub fn gcra_patterns(&self) -> Vec<String> {
        vec![
            format!("{}:throttle*", self.tag),
            format!("{}:rl*", self.tag),
        ]
    }

    /// Scan pattern matching every key of the account.
    #[must_use]
    pub fn all_pattern(&self) -> String {
        format!("{}:*", self.tag)
    }

    /// Returns true when `key` is one of this account's GCRA keys.
    #[must_use]
    pub fn is_gcra_key(&self, key: &str) -> bool {
        key.strip_prefix(self.tag.as_str())
            .is_some_and(|rest| rest.starts_with(":throttle") || rest.starts_with(":rl"))
    }

    fn gcra(&self, namespace: &str, scope: Scope, evaluated: &str, env: EnvId) -> String {
        match scope {
            Scope::Function => format!("{}:{namespace}:{evaluated}", self.tag),
            Scope::Env => format!("{}:{namespace}:e:{env}:{evaluated}", self.tag),
            Scope::Account => format!("{}:{namespace}:a:{}:{evaluated}", self.tag, self.account),
        }
    }

    fn entity(&self, scope: Scope, env: EnvId, function: FunctionId) -> String {
        match scope {
            Scope::Account => self.account.to_string(),
            Scope::Env => env.to_string(),
            Scope::Function => function.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConcurrencyMode;

    fn ids() -> (AccountId, EnvId, FunctionId) {
        (
            "11111111-2222-3333-4444-555555555555".parse().unwrap(),
            "66666666-7777-8888-9999-aaaaaaaaaaaa".parse().unwrap(),
            "ffffffff-1111-2222-3333-444444444444".parse().unwrap(),
        )
    }

    #[test]
    fn concurrency_keys_use_scope_entity() {
        let (account, env, function) = ids();
        let keys = KeyPrefix::new("test").account(account);

        let acct = ConcurrencyConstraint::new(ConcurrencyMode::Step, Scope::Account);
        assert_eq!(
            keys.concurrency(&acct, env, function),
            "{test:11111111-2222-3333-4444-555555555555}:concurrency:a:11111111-2222-3333-4444-555555555555"
        );

        let fun = ConcurrencyConstraint::new(ConcurrencyMode::Run, Scope::Function);
        assert_eq!(
            keys.concurrency(&fun, env, function),
            "{test:11111111-2222-3333-4444-555555555555}:concurrency:f:ffffffff-1111-2222-3333-444444444444"
        );
    }

    #[test]
    fn custom_concurrency_keys_append_hashes() {
        let (account, env, function) = ids();
        let keys = KeyPrefix::new("test").account(account);
        let custom = ConcurrencyConstraint::new(ConcurrencyMode::Step, Scope::Env)
            .with_custom_key("expr", "eval");
        let key = keys.concurrency(&custom, env, function);
        assert!(key.ends_with(":concurrency:e:66666666-7777-8888-9999-aaaaaaaaaaaa<expr:eval>"));
    }

    #[test]
    fn mode_does_not_change_concurrency_key() {
        let (account, env, function) = ids();
        let keys = KeyPrefix::new("test").account(account);
        let step = ConcurrencyConstraint::new(ConcurrencyMode::Step, Scope::Function);
        let run = ConcurrencyConstraint::new(ConcurrencyMode::Run, Scope::Function);
        assert_eq!(
            keys.concurrency(&step, env, function),
            keys.concurrency(&run, env, function)
        );
    }

    #[test]
    fn gcra_keys_by_scope() {
        let (account, env, _) = ids();
        let keys = KeyPrefix::new("test").account(account);
        let throttle = |scope| ThrottleConstraint {
            scope,
            key_expression_hash: String::new(),
            evaluated_key_hash: "xyz".into(),
        };
        assert_eq!(
            keys.throttle(&throttle(Scope::Function), env),
            "{test:11111111-2222-3333-4444-555555555555}:throttle:xyz"
        );
        assert_eq!(
            keys.throttle(&throttle(Scope::Env), env),
            "{test:11111111-2222-3333-4444-555555555555}:throttle:e:66666666-7777-8888-9999-aaaaaaaaaaaa:xyz"
        );

        let rl = RateLimitConstraint {
            scope: Scope::Account,
            key_expression_hash: String::new(),
            evaluated_key_hash: "abc".into(),
        };
        let key = keys.rate_limit(&rl, env);
        assert_eq!(
            key,
            "{test:11111111-2222-3333-4444-555555555555}:rl:a:11111111-2222-3333-4444-555555555555:abc"
        );
        assert!(keys.is_gcra_key(&key));
        assert!(!keys.is_gcra_key(&keys.lease_index()));
    }

    #[test]
    fn every_account_key_carries_the_hash_tag() {
        let (account, env, function) = ids();
        let keys = KeyPrefix::new("test").account(account);
        let lease = LeaseId::for_expiry_ms(1_700_000_000_000);
        let concurrency = ConcurrencyConstraint::new(ConcurrencyMode::Step, Scope::Function);
        let all = [
            keys.lease(&lease),
            keys.superseded(&lease),
            keys.lease_index(),
            keys.request_state(&RequestId::at(chrono::Utc::now())),
            keys.idempotency(IdempotencyOp::Release, "k"),
            keys.concurrency(&concurrency, env, function),
        ];
        for key in &all {
            assert!(key.starts_with("{test:11111111-2222-3333-4444-555555555555}:"), "{key}");
        }
        assert!(all[..5].iter().all(|k| k.matches(&account.to_string()).count() == 1));
    }

    #[test]
    fn idempotency_keys_hash_caller_key() {
        let (account, ..) = ids();
        let keys = KeyPrefix::new("p").account(account);
        let key = keys.idempotency(IdempotencyOp::Acquire, "caller-key");
        assert!(key.contains(":ik:acq:"));
        assert!(!key.contains("caller-key"));
        assert_eq!(key.rsplit(':').next().map(str::len), Some(64));
    }

    #[test]
    fn scavenger_shard_is_stable_and_bounded() {
        let (account, ..) = ids();
        let a = scavenger_shard_index(account, 16);
        let b = scavenger_shard_index(account, 16);
        assert_eq!(a, b);
        assert!(a < 16);
        assert_eq!(scavenger_shard_index(account, 0), 0);
        assert_eq!(KeyPrefix::new("p").scavenger_shard(3), "{p}:scav:3");
    }
}
