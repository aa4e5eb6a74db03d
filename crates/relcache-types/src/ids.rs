//! Identifier newtypes.
//!
//! Entity type names and entity ids are both plain strings on the wire, but
//! mixing them up is a classic source of bugs in cache keys. Each gets its own
//! newtype so the compiler keeps `(type, id)` pairs straight.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around [`String`] with standard derives.
macro_rules! define_name {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new value from anything string-like.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return the inner [`String`].
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_name! {
    /// Name of an entity type, e.g. `Account` or `Transfer`.
    EntityName
}

define_name! {
    /// Stable identifier of a single entity within its type.
    EntityId
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn names_serialize_as_plain_strings() {
        let name = EntityName::from("Account");
        let json = serde_json::to_string(&name).ok();
        assert_eq!(json.as_deref(), Some("\"Account\""));
    }

    #[test]
    fn borrowed_lookup_by_str() {
        let mut map = BTreeMap::new();
        map.insert(EntityId::from("0xabc"), 1_u8);
        assert_eq!(map.get("0xabc"), Some(&1));
    }

    #[test]
    fn display_matches_inner() {
        let id = EntityId::new(String::from("t1"));
        assert_eq!(id.to_string(), "t1");
        assert_eq!(id.into_inner(), "t1");
    }
}
