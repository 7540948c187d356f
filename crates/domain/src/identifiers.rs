//! Strongly-typed identifier types for persisted entities.
//!
//! Every entity table uses a surrogate `i64` key drawn from a per-table
//! sequence. The wrappers below keep a `MemberId` from being passed where a
//! `TeamId` is expected while still exposing the raw key to the store layer.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;

/// Common behaviour of entity identifiers.
///
/// The store layer only ever sees raw `i64` keys; repositories convert at the
/// boundary with [`EntityId::from_raw`] and [`EntityId::raw`].
pub trait EntityId:
    Copy + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    /// Wrap a raw key produced by the store.
    fn from_raw(raw: i64) -> Self;

    /// The raw key as stored.
    fn raw(self) -> i64;
}

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Create an ID from a raw key
            #[inline]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Get the underlying key
            #[inline]
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl EntityId for $name {
            #[inline]
            fn from_raw(raw: i64) -> Self {
                Self(raw)
            }

            #[inline]
            fn raw(self) -> i64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl From<$name> for crate::value::Value {
            fn from(id: $name) -> Self {
                crate::value::Value::Int(id.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id!(MemberId, "Unique identifier for members");

define_id!(TeamId, "Unique identifier for teams");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_equality() {
        let id1 = MemberId::new(7);
        let id2 = MemberId::from_raw(7);
        assert_eq!(id1, id2);
        assert_eq!(id1.raw(), 7);
    }

    #[test]
    fn test_id_from_string() {
        let id: TeamId = "42".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_id_serialization() {
        let id = MemberId::new(3);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "3");
        let deserialized: MemberId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_different_id_types() {
        let member_id = MemberId::new(1);
        let team_id = TeamId::new(1);

        // This should not compile (different types):
        // assert_eq!(member_id, team_id);

        assert_eq!(i64::from(member_id), i64::from(team_id));
    }
}
