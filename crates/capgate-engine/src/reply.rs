//! Script reply decoding.
//!
//! Script runtimes may encode an empty list as an empty object, so list
//! fields are declared as [`FlexVec`], which accepts `[]`, `[..]` and `{}`.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A list that also decodes from an empty object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexVec<T>(pub Vec<T>);

impl<T> Default for FlexVec<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> FlexVec<T> {
    /// Unwraps the list.
    #[must_use]
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for FlexVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T> From<Vec<T>> for FlexVec<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<T: Serialize> Serialize for FlexVec<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FlexVec<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FlexVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for FlexVisitor<T> {
            type Value = FlexVec<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list or an empty object")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(FlexVec(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                if map.next_key::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::custom("expected an empty object in place of a list"));
                }
                Ok(FlexVec(Vec::new()))
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(FlexVec(Vec::new()))
            }
        }

        deserializer.deserialize_any(FlexVisitor(PhantomData))
    }
}

/// Decodes the JSON reply of `script`.
///
/// # Errors
///
/// Returns [`Error::MalformedResponse`] when the reply does not match `T`.
pub fn decode<T: DeserializeOwned>(script: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::MalformedResponse {
        script: script.to_string(),
        message: e.to_string(),
    })
}
