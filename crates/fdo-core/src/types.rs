//! Identifiers and algorithm tags shared across the FDO engines

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use subtle::ConstantTimeEq;

use crate::cbor_array;
use crate::errors::{FdoError, FdoResult};

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr, $label:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Encoded length in bytes
            pub const LEN: usize = $len;

            /// Wrap raw bytes
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Parse from a slice of exactly the right length
            pub fn from_slice(bytes: &[u8]) -> FdoResult<Self> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    FdoError::malformed(format!(
                        "{} must be {} bytes, got {}",
                        $label,
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            /// Generate from the operating system RNG
            pub fn random() -> Self {
                let mut bytes = [0u8; $len];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Borrow the raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes = ByteBuf::deserialize(deserializer)?;
                Self::from_slice(&bytes).map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// 16-byte device identifier
    Guid,
    16,
    "Guid"
);

fixed_bytes!(
    /// 16-byte protocol nonce
    Nonce,
    16,
    "Nonce"
);

impl Nonce {
    /// Constant-time comparison
    pub fn ct_eq(&self, other: &Nonce) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

/// Hash and HMAC algorithm identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum HashType {
    /// SHA-256 digest
    Sha256,
    /// SHA-384 digest
    Sha384,
    /// HMAC with SHA-256
    HmacSha256,
    /// HMAC with SHA-384
    HmacSha384,
}

impl HashType {
    /// Output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 | Self::HmacSha256 => 32,
            Self::Sha384 | Self::HmacSha384 => 48,
        }
    }

    /// Whether this identifier names a keyed MAC
    pub fn is_hmac(self) -> bool {
        matches!(self, Self::HmacSha256 | Self::HmacSha384)
    }
}

impl TryFrom<i64> for HashType {
    type Error = FdoError;

    fn try_from(value: i64) -> FdoResult<Self> {
        match value {
            -16 => Ok(Self::Sha256),
            -43 => Ok(Self::Sha384),
            5 => Ok(Self::HmacSha256),
            6 => Ok(Self::HmacSha384),
            other => Err(FdoError::unsupported(format!("hash type {other}"))),
        }
    }
}

impl From<HashType> for i64 {
    fn from(value: HashType) -> Self {
        match value {
            HashType::Sha256 => -16,
            HashType::Sha384 => -43,
            HashType::HmacSha256 => 5,
            HashType::HmacSha384 => 6,
        }
    }
}

cbor_array! {
    /// Digest or MAC value tagged with its algorithm: `[hashType, hash]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Hash {
        /// Algorithm identifier
        pub hash_type: HashType,
        /// Raw digest bytes
        pub value: ByteBuf,
    }
}

impl Hash {
    /// Wrap a computed digest
    pub fn new(hash_type: HashType, value: Vec<u8>) -> Self {
        Self {
            hash_type,
            value: ByteBuf::from(value),
        }
    }

    /// Constant-time comparison of algorithm and value
    pub fn ct_eq(&self, other: &Hash) -> bool {
        self.hash_type == other.hash_type && bool::from(self.value.as_slice().ct_eq(other.value.as_slice()))
    }
}

/// Key exchange suites named in `HelloDevice`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KexSuite {
    /// Finite-field Diffie-Hellman, RFC 3526 group 14 (2048-bit)
    DhKexId14,
    /// Finite-field Diffie-Hellman, RFC 3526 group 15 (3072-bit)
    DhKexId15,
    /// ECDH over P-256
    Ecdh256,
    /// ECDH over P-384
    Ecdh384,
    /// RSA key transport with a 2048-bit key
    AsymKex2048,
    /// RSA key transport with a 3072-bit key
    AsymKex3072,
}

impl KexSuite {
    /// All suites in wire-name order
    pub const ALL: [KexSuite; 6] = [
        Self::DhKexId14,
        Self::DhKexId15,
        Self::Ecdh256,
        Self::Ecdh384,
        Self::AsymKex2048,
        Self::AsymKex3072,
    ];

    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::DhKexId14 => "DHKEXid14",
            Self::DhKexId15 => "DHKEXid15",
            Self::Ecdh256 => "ECDH256",
            Self::Ecdh384 => "ECDH384",
            Self::AsymKex2048 => "ASYMKEX2048",
            Self::AsymKex3072 => "ASYMKEX3072",
        }
    }
}

impl fmt::Display for KexSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KexSuite {
    type Err = FdoError;

    fn from_str(s: &str) -> FdoResult<Self> {
        Self::ALL
            .into_iter()
            .find(|suite| suite.name() == s)
            .ok_or_else(|| FdoError::unsupported(format!("unknown key exchange suite {s:?}")))
    }
}

impl TryFrom<String> for KexSuite {
    type Error = FdoError;

    fn try_from(value: String) -> FdoResult<Self> {
        value.parse()
    }
}

impl From<KexSuite> for String {
    fn from(value: KexSuite) -> Self {
        value.name().to_string()
    }
}

/// Session encryption suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum CipherSuite {
    /// AES-128 in GCM mode
    A128Gcm,
    /// AES-256 in GCM mode
    A256Gcm,
}

impl CipherSuite {
    /// Wire identifier (COSE algorithm number)
    pub fn id(self) -> i64 {
        match self {
            Self::A128Gcm => 1,
            Self::A256Gcm => 3,
        }
    }

    /// Symmetric key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            Self::A128Gcm => 16,
            Self::A256Gcm => 32,
        }
    }

    /// Configuration name
    pub fn name(self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A256Gcm => "A256GCM",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<i64> for CipherSuite {
    type Error = FdoError;

    fn try_from(value: i64) -> FdoResult<Self> {
        match value {
            1 => Ok(Self::A128Gcm),
            3 => Ok(Self::A256Gcm),
            other => Err(FdoError::unsupported(format!("cipher suite {other}"))),
        }
    }
}

impl From<CipherSuite> for i64 {
    fn from(value: CipherSuite) -> Self {
        value.id()
    }
}

impl FromStr for CipherSuite {
    type Err = FdoError;

    fn from_str(s: &str) -> FdoResult<Self> {
        match s {
            "A128GCM" => Ok(Self::A128Gcm),
            "A256GCM" => Ok(Self::A256Gcm),
            other => Err(FdoError::unsupported(format!("unknown cipher suite {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn test_guid_length_enforced() {
        assert!(Guid::from_slice(&[0u8; 16]).is_ok());
        assert!(matches!(
            Guid::from_slice(&[0u8; 15]),
            Err(FdoError::MalformedInput { .. })
        ));

        let short = codec::to_vec(&ByteBuf::from(vec![1u8; 8])).unwrap();
        assert!(codec::from_slice::<Nonce>(&short).is_err());
    }

    #[test]
    fn test_nonce_encodes_as_bstr() {
        let nonce = Nonce::from_bytes([0x11; 16]);
        let bytes = codec::to_vec(&nonce).unwrap();
        assert_eq!(bytes[0], 0x50);
        assert_eq!(codec::from_slice::<Nonce>(&bytes).unwrap(), nonce);
    }

    #[test]
    fn test_random_nonces_differ() {
        assert_ne!(Nonce::random(), Nonce::random());
    }

    #[test]
    fn test_hash_wire_layout() {
        let hash = Hash::new(HashType::Sha256, vec![0xab; 32]);
        let bytes = codec::to_vec(&hash).unwrap();
        assert_eq!(&bytes[..3], &[0x82, 0x2f, 0x58]);
        assert_eq!(codec::from_slice::<Hash>(&bytes).unwrap(), hash);
    }

    #[test]
    fn test_kex_suite_names() {
        for suite in KexSuite::ALL {
            assert_eq!(suite.name().parse::<KexSuite>().unwrap(), suite);
        }
        assert!(matches!(
            "ECDH521".parse::<KexSuite>(),
            Err(FdoError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_cipher_suite_ids() {
        assert_eq!(CipherSuite::try_from(1).unwrap(), CipherSuite::A128Gcm);
        assert_eq!(CipherSuite::try_from(3).unwrap(), CipherSuite::A256Gcm);
        assert!(CipherSuite::try_from(2).is_err());
        assert_eq!(CipherSuite::A256Gcm.key_len(), 32);
    }
}
