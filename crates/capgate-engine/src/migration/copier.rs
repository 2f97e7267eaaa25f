//! Key copy strategies.
//!
//! A copier makes the destination key mirror the source key: same value,
//! same remaining TTL, and absent when the source key is absent. The last
//! rule matters for dirty keys, which are often keys a release deleted.

use std::fmt;

use async_trait::async_trait;
use capgate_store::{KeyType, KeyValueStore};

use crate::error::Result;

/// What a copy did to the destination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The source value was written.
    Copied,
    /// The source key is gone; the destination key was removed too.
    Removed,
}

/// Copies one key between stores.
#[async_trait]
pub trait KeyCopier: Send + Sync + fmt::Debug {
    /// Mirrors `source_key` on `source` into `destination_key` on
    /// `destination`.
    ///
    /// # Errors
    ///
    /// Returns the store error of the failing command.
    async fn copy(
        &self,
        source: &dyn KeyValueStore,
        source_key: &str,
        destination: &dyn KeyValueStore,
        destination_key: &str,
    ) -> Result<CopyOutcome>;
}

/// Remaining TTL to carry over; `None` when the key vanished meanwhile.
async fn carried_ttl(source: &dyn KeyValueStore, key: &str) -> Result<Option<i64>> {
    Ok(match source.pttl(key).await? {
        -2 => None,
        ttl if ttl < 0 => Some(0),
        ttl => Some(ttl),
    })
}

async fn remove(destination: &dyn KeyValueStore, key: &str) -> Result<CopyOutcome> {
    destination.unlink(&[key.to_string()]).await?;
    Ok(CopyOutcome::Removed)
}

/// Copies the serialized value with `DUMP`/`RESTORE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpRestoreCopier;

#[async_trait]
impl KeyCopier for DumpRestoreCopier {
    async fn copy(
        &self,
        source: &dyn KeyValueStore,
        source_key: &str,
        destination: &dyn KeyValueStore,
        destination_key: &str,
    ) -> Result<CopyOutcome> {
        let Some(payload) = source.dump(source_key).await? else {
            return remove(destination, destination_key).await;
        };
        let Some(ttl) = carried_ttl(source, source_key).await? else {
            return remove(destination, destination_key).await;
        };
        destination
            .restore(destination_key, ttl, &payload, true)
            .await?;
        Ok(CopyOutcome::Copied)
    }
}

/// Copies with per-type reads and writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeAwareCopier;

#[async_trait]
impl KeyCopier for TypeAwareCopier {
    async fn copy(
        &self,
        source: &dyn KeyValueStore,
        source_key: &str,
        destination: &dyn KeyValueStore,
        destination_key: &str,
    ) -> Result<CopyOutcome> {
        let kind = source.key_type(source_key).await?;
        if kind == KeyType::None {
            return remove(destination, destination_key).await;
        }
        let Some(ttl) = carried_ttl(source, source_key).await? else {
            return remove(destination, destination_key).await;
        };
        let expiry = (ttl > 0).then_some(ttl);

        match kind {
            KeyType::String => {
                let Some(value) = source.get(source_key).await? else {
                    return remove(destination, destination_key).await;
                };
                destination.set(destination_key, value, expiry).await?;
            }
            KeyType::Hash => {
                let fields = source.hgetall(source_key).await?;
                destination.unlink(&[destination_key.to_string()]).await?;
                if fields.is_empty() {
                    return Ok(CopyOutcome::Removed);
                }
                destination.hset(destination_key, fields).await?;
            }
            KeyType::ZSet => {
                let members = source.zrange_with_scores(source_key).await?;
                destination.unlink(&[destination_key.to_string()]).await?;
                if members.is_empty() {
                    return Ok(CopyOutcome::Removed);
                }
                for (member, score) in &members {
                    destination.zadd(destination_key, member, *score).await?;
                }
            }
            KeyType::None => return remove(destination, destination_key).await,
        }

        if kind != KeyType::String
            && let Some(ttl) = expiry
        {
            destination.pexpire(destination_key, ttl).await?;
        }
        Ok(CopyOutcome::Copied)
    }
}
