//! Strongly-typed identifiers.
//!
//! Tenancy identifiers (account, environment, function) are UUIDs assigned by
//! the caller. Identifiers minted by capgate itself are ULIDs:
//!
//! - **Lease IDs** embed the lease *expiry* as their timestamp, so the lease
//!   index can be range-scanned and an ID always tells you when it lapses.
//! - **Request IDs** group the leases granted by one acquire call.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use capgate_core::id::LeaseId;
//!
//! let expiry = Utc::now() + Duration::seconds(30);
//! let lease = LeaseId::for_expiry(expiry);
//! assert_eq!(lease.expiry_ms(), expiry.timestamp_millis());
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Returns true for the all-zero UUID, which callers use for "unset".
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " '{}': {}"), s, e),
                })
            }
        }
    };
}

uuid_id!(
    /// The tenant that owns every piece of constraint state.
    AccountId,
    "account ID"
);

uuid_id!(
    /// An environment within an account.
    EnvId,
    "environment ID"
);

uuid_id!(
    /// A function within an environment.
    FunctionId,
    "function ID"
);

fn ulid_at_ms(ms: i64) -> Ulid {
    let offset = Duration::from_millis(u64::try_from(ms).unwrap_or(0));
    Ulid::from_datetime(SystemTime::UNIX_EPOCH + offset)
}

fn datetime_from_ms(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Identifier of a capacity lease.
///
/// The ULID timestamp is the lease expiry. Extending a lease mints a new ID
/// carrying the new expiry; the previous ID stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Ulid);

impl LeaseId {
    /// Creates a lease ID whose embedded timestamp is `expiry`.
    #[must_use]
    pub fn for_expiry(expiry: DateTime<Utc>) -> Self {
        Self::for_expiry_ms(expiry.timestamp_millis())
    }

    /// Creates a lease ID whose embedded timestamp is `expiry_ms` (unix millis).
    #[must_use]
    pub fn for_expiry_ms(expiry_ms: i64) -> Self {
        Self(ulid_at_ms(expiry_ms))
    }

    /// Creates a lease ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the expiry encoded in the ID, in unix milliseconds.
    #[must_use]
    pub fn expiry_ms(&self) -> i64 {
        i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX)
    }

    /// Returns the expiry encoded in the ID.
    #[must_use]
    pub fn expiry(&self) -> DateTime<Utc> {
        datetime_from_ms(self.0.timestamp_ms())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid lease ID '{s}': {e}"),
            })
    }
}

/// Identifier of a single acquire call; shared by every lease it granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Ulid);

impl RequestId {
    /// Generates a new request ID stamped with `now`.
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(ulid_at_ms(now.timestamp_millis()))
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid request ID '{s}': {e}"),
            })
    }
}

/// A function run a lease is held on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Generates a new unique run ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a run ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        datetime_from_ms(self.0.timestamp_ms())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid run ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lease_id_embeds_expiry() {
        let expiry = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).unwrap();
        let id = LeaseId::for_expiry(expiry);
        assert_eq!(id.expiry(), expiry);
        assert_eq!(id.expiry_ms(), expiry.timestamp_millis());
    }

    #[test]
    fn lease_ids_with_same_expiry_differ() {
        let a = LeaseId::for_expiry_ms(1_700_000_000_000);
        let b = LeaseId::for_expiry_ms(1_700_000_000_000);
        assert_ne!(a, b);
        assert_eq!(a.expiry_ms(), b.expiry_ms());
    }

    #[test]
    fn lease_ids_sort_by_expiry() {
        let early = LeaseId::for_expiry_ms(1_700_000_000_000);
        let late = LeaseId::for_expiry_ms(1_700_000_001_000);
        assert!(early.to_string() < late.to_string());
    }

    #[test]
    fn lease_id_roundtrips_through_string() {
        let id = LeaseId::for_expiry_ms(1_700_000_000_000);
        let parsed: LeaseId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        assert!("not-a-ulid".parse::<LeaseId>().is_err());
        let err = "nope".parse::<AccountId>().unwrap_err();
        assert!(err.to_string().contains("invalid account ID"));
    }

    #[test]
    fn nil_uuid_is_unset() {
        assert!(AccountId::from_uuid(Uuid::nil()).is_nil());
        assert!(!AccountId::generate().is_nil());
    }
}
