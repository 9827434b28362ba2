//! CBOR codec for FDO wire structures
//!
//! FDO messages are CBOR arrays whose positions carry meaning, while serde's derive
//! writes structs as maps. [`cbor_array!`](crate::cbor_array) declares a named struct
//! that is encoded positionally, so message types stay readable in Rust while
//! matching the wire layout exactly.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{FdoError, FdoResult};

/// Serialize a value to CBOR bytes
pub fn to_vec<T: Serialize>(value: &T) -> FdoResult<Vec<u8>> {
    serde_cbor::to_vec(value)
        .map_err(|e| FdoError::internal(format!("Failed to serialize to CBOR: {e}")))
}

/// Deserialize CBOR bytes, rejecting trailing data
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> FdoResult<T> {
    serde_cbor::from_slice(bytes)
        .map_err(|e| FdoError::malformed(format!("Failed to decode CBOR: {e}")))
}

/// Re-encode a decoded CBOR value as a concrete type
pub fn from_value<T: DeserializeOwned>(value: serde_cbor::Value) -> FdoResult<T> {
    serde_cbor::value::from_value(value)
        .map_err(|e| FdoError::malformed(format!("Unexpected CBOR structure: {e}")))
}

/// Declare a struct encoded as a fixed-length CBOR array
///
/// Fields are written in declaration order. Decoding rejects arrays of any other
/// length. Up to sixteen fields are supported.
///
/// ```
/// use fdo_core::cbor_array;
///
/// cbor_array! {
///     #[derive(Debug, PartialEq)]
///     pub struct Pair {
///         pub left: u8,
///         pub right: String,
///     }
/// }
///
/// let bytes = fdo_core::codec::to_vec(&Pair { left: 1, right: "a".into() }).unwrap();
/// assert_eq!(bytes, vec![0x82, 0x01, 0x61, b'a']);
/// ```
#[macro_export]
macro_rules! cbor_array {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )+
        }

        impl ::serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> ::core::result::Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                use ::serde::ser::SerializeTuple;
                let len = [$(stringify!($field)),+].len();
                let mut tuple = serializer.serialize_tuple(len)?;
                $(tuple.serialize_element(&self.$field)?;)+
                tuple.end()
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::core::result::Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                let ($($field,)+) =
                    <($($ty,)+) as ::serde::Deserialize<'de>>::deserialize(deserializer)?;
                Ok(Self { $($field),+ })
            }
        }
    };
}
