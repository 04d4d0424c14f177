//! # berth-id
//!
//! Typed identifiers for everything the provisioning engine touches.
//!
//! Every id is rendered as `{prefix}_{ulid}`, for example
//! `usr_01HV4Z2WQXKJNM8GPQY6VBKC3D` or `alloc_01HV4Z4NYPLTRS0JTUA8XDME5F`.
//! The prefix is checked on parse so a location id can never be passed where
//! a node id is expected, and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;

#[doc(hidden)]
pub use serde as __serde;

/// A ULID tagged with a fixed resource prefix.
pub trait TypedId: Copy {
    const PREFIX: &'static str;

    fn from_ulid(ulid: Ulid) -> Self;

    fn ulid(&self) -> Ulid;
}

/// Parses `{T::PREFIX}_{ulid}`.
///
/// The prefix is split at the first `_`; prefixes never contain one.
pub fn parse_prefixed<T: TypedId>(s: &str) -> Result<T, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let (prefix, raw) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
    if prefix != T::PREFIX {
        return Err(IdError::InvalidPrefix {
            expected: T::PREFIX,
            actual: prefix.to_string(),
        });
    }

    Ulid::from_string(raw)
        .map(T::from_ulid)
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
