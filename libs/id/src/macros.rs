//! Id type generators.

/// Defines a ULID-backed ID written as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(BatchId, "batch");
///
/// let id = BatchId::new();
/// assert_eq!(id, id.to_string().parse()?);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh id; ids created later sort after this one.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                let body = s
                    .strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .ok_or_else(|| $crate::IdError::malformed(Self::PREFIX, s))?;
                body.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|_| $crate::IdError::malformed(Self::PREFIX, s))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<'de, str> as serde::Deserialize>::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Defines an integer id handed out by one owner (the ledger, the host, the
/// port registry). Formats and serializes as the bare number.
#[macro_export]
macro_rules! define_counter_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($repr);

        impl $name {
            #[must_use]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn value(&self) -> $repr {
                self.0
            }

            /// The id issued after this one.
            #[must_use]
            pub const fn next(&self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                s.parse::<$repr>()
                    .map(Self)
                    .map_err(|_| $crate::IdError::InvalidNumber(s.to_string()))
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $repr {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serde::Serialize::serialize(&self.0, serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                <$repr as serde::Deserialize>::deserialize(deserializer).map(Self)
            }
        }
    };
}
