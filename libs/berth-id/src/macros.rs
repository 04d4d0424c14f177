/// Declares a `Copy` id newtype over a ULID, rendered as `{prefix}_{ulid}`.
///
/// Parsing and validation live in [`crate::parse_prefixed`]; the macro only
/// wires the type into `Display`, `FromStr` and serde.
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $crate::TypedId for $name {
            const PREFIX: &'static str = $prefix;

            fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            fn ulid(&self) -> $crate::Ulid {
                self.0
            }
        }

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            pub fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::parse_prefixed::<Self>(s)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<$crate::Ulid> for $name {
            fn from(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $crate::parse_prefixed::<Self>(s)
            }
        }

        impl $crate::__serde::Serialize for $name {
            fn serialize<S: $crate::__serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> $crate::__serde::Deserialize<'de> for $name {
            fn deserialize<D: $crate::__serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <::std::borrow::Cow<'de, str> as $crate::__serde::Deserialize<'de>>::deserialize(
                    deserializer,
                )?;
                $crate::parse_prefixed::<Self>(&raw).map_err($crate::__serde::de::Error::custom)
            }
        }
    };
}
