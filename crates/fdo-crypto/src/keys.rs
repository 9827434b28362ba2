//! Public key wire encoding and signing keys
//!
//! An FDO public key travels as `[pkType, pkEnc, pkBody]`. The body depends on
//! the encoding, so it is modelled as a tagged union rather than a raw blob.

use std::fmt;

use fdo_core::{FdoError, FdoResult};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::X509;
use serde::de::Error as _;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::Bytes;
use serde_cbor::Value;

use crate::backend;
use crate::cose::{CoseSignature, ProtectedHeader, UnprotectedHeader};

/// Public key algorithm family (`pkType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum PublicKeyType {
    /// RSA 2048 with restricted exponent
    Rsa2048Restr,
    /// RSA with PKCS#1 v1.5 signatures
    RsaPkcs,
    /// RSA with PSS signatures
    RsaPss,
    /// ECDSA over P-256
    Secp256r1,
    /// ECDSA over P-384
    Secp384r1,
}

impl TryFrom<i64> for PublicKeyType {
    type Error = FdoError;

    fn try_from(value: i64) -> FdoResult<Self> {
        match value {
            1 => Ok(Self::Rsa2048Restr),
            5 => Ok(Self::RsaPkcs),
            6 => Ok(Self::RsaPss),
            10 => Ok(Self::Secp256r1),
            11 => Ok(Self::Secp384r1),
            other => Err(FdoError::malformed(format!("unknown public key type {other}"))),
        }
    }
}

impl From<PublicKeyType> for i64 {
    fn from(value: PublicKeyType) -> Self {
        match value {
            PublicKeyType::Rsa2048Restr => 1,
            PublicKeyType::RsaPkcs => 5,
            PublicKeyType::RsaPss => 6,
            PublicKeyType::Secp256r1 => 10,
            PublicKeyType::Secp384r1 => 11,
        }
    }
}

/// Public key body encoding (`pkEnc`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum PublicKeyEncoding {
    /// DER SubjectPublicKeyInfo
    Crypto,
    /// Single DER certificate
    X509,
    /// Leaf-first list of DER certificates
    X5Chain,
    /// COSE_Key map
    CoseKey,
}

impl TryFrom<i64> for PublicKeyEncoding {
    type Error = FdoError;

    fn try_from(value: i64) -> FdoResult<Self> {
        match value {
            0 => Ok(Self::Crypto),
            1 => Ok(Self::X509),
            2 => Ok(Self::X5Chain),
            3 => Ok(Self::CoseKey),
            other => Err(FdoError::malformed(format!("unknown public key encoding {other}"))),
        }
    }
}

impl From<PublicKeyEncoding> for i64 {
    fn from(value: PublicKeyEncoding) -> Self {
        match value {
            PublicKeyEncoding::Crypto => 0,
            PublicKeyEncoding::X509 => 1,
            PublicKeyEncoding::X5Chain => 2,
            PublicKeyEncoding::CoseKey => 3,
        }
    }
}

/// Signature algorithm tag (`sgType`), numerically the COSE algorithm id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SigType {
    /// ECDSA P-256 with SHA-256
    StSecp256r1,
    /// ECDSA P-384 with SHA-384
    StSecp384r1,
    /// RSA 2048 PKCS#1 v1.5 with SHA-256
    StRsa2048,
    /// RSA 3072 PKCS#1 v1.5 with SHA-384
    StRsa3072,
    /// Intel EPID 1.0
    StEpid10,
    /// Intel EPID 1.1
    StEpid11,
}

impl SigType {
    /// COSE algorithm identifier
    pub fn id(self) -> i64 {
        match self {
            Self::StSecp256r1 => -7,
            Self::StSecp384r1 => -35,
            Self::StRsa2048 => -257,
            Self::StRsa3072 => -258,
            Self::StEpid10 => 90,
            Self::StEpid11 => 91,
        }
    }

    /// Key family a signer of this type must hold
    pub fn public_key_type(self) -> FdoResult<PublicKeyType> {
        match self {
            Self::StSecp256r1 => Ok(PublicKeyType::Secp256r1),
            Self::StSecp384r1 => Ok(PublicKeyType::Secp384r1),
            Self::StRsa2048 | Self::StRsa3072 => Ok(PublicKeyType::RsaPkcs),
            Self::StEpid10 | Self::StEpid11 => Err(FdoError::unsupported(format!(
                "{self:?} signatures are not implemented"
            ))),
        }
    }
}

impl TryFrom<i64> for SigType {
    type Error = FdoError;

    fn try_from(value: i64) -> FdoResult<Self> {
        match value {
            -7 => Ok(Self::StSecp256r1),
            -35 => Ok(Self::StSecp384r1),
            -257 => Ok(Self::StRsa2048),
            -258 => Ok(Self::StRsa3072),
            90 => Ok(Self::StEpid10),
            91 => Ok(Self::StEpid11),
            other => Err(FdoError::unsupported(format!("signature type {other}"))),
        }
    }
}

impl From<SigType> for i64 {
    fn from(value: SigType) -> Self {
        value.id()
    }
}

/// Encoded public key body
#[derive(Clone, PartialEq)]
pub enum PublicKeyBody {
    /// DER SubjectPublicKeyInfo
    Crypto(Vec<u8>),
    /// Single DER certificate
    X509(Vec<u8>),
    /// Leaf-first DER certificate chain
    X5Chain(Vec<Vec<u8>>),
    /// COSE_Key, carried but not interpreted
    CoseKey(Value),
}

impl fmt::Debug for PublicKeyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(der) => write!(f, "Crypto({} bytes)", der.len()),
            Self::X509(der) => write!(f, "X509({} bytes)", der.len()),
            Self::X5Chain(chain) => write!(f, "X5Chain({} certs)", chain.len()),
            Self::CoseKey(_) => f.write_str("CoseKey"),
        }
    }
}

/// Public key as carried in vouchers and message headers
#[derive(Debug, Clone, PartialEq)]
pub struct FdoPublicKey {
    /// Algorithm family
    pub pk_type: PublicKeyType,
    /// Encoded key material
    pub body: PublicKeyBody,
}

impl FdoPublicKey {
    /// Encoding tag implied by the body
    pub fn encoding(&self) -> PublicKeyEncoding {
        match self.body {
            PublicKeyBody::Crypto(_) => PublicKeyEncoding::Crypto,
            PublicKeyBody::X509(_) => PublicKeyEncoding::X509,
            PublicKeyBody::X5Chain(_) => PublicKeyEncoding::X5Chain,
            PublicKeyBody::CoseKey(_) => PublicKeyEncoding::CoseKey,
        }
    }

    /// Wrap an OpenSSL public key as a DER SubjectPublicKeyInfo
    pub fn from_pkey<T>(pk_type: PublicKeyType, key: &PKeyRef<T>) -> FdoResult<Self>
    where
        T: openssl::pkey::HasPublic,
    {
        let der = key
            .public_key_to_der()
            .map_err(backend("encode SubjectPublicKeyInfo"))?;
        Ok(Self {
            pk_type,
            body: PublicKeyBody::Crypto(der),
        })
    }

    /// Key to verify with, resolving certificates and chains to their leaf
    pub fn to_pkey(&self) -> FdoResult<PKey<Public>> {
        match &self.body {
            PublicKeyBody::Crypto(der) => PKey::public_key_from_der(der)
                .map_err(|e| FdoError::malformed(format!("invalid SubjectPublicKeyInfo: {e}"))),
            PublicKeyBody::X509(der) => {
                let cert = X509::from_der(der)
                    .map_err(|e| FdoError::malformed(format!("invalid certificate: {e}")))?;
                cert.public_key()
                    .map_err(|e| FdoError::malformed(format!("certificate key unreadable: {e}")))
            }
            PublicKeyBody::X5Chain(chain) => crate::cert_chain::validate_chain(chain.as_slice())?.leaf_public_key(),
            PublicKeyBody::CoseKey(_) => Err(FdoError::unsupported(
                "COSE_Key public key encoding is not implemented",
            )),
        }
    }

    /// Same key material, ignoring how it is wrapped
    pub fn same_key(&self, other: &FdoPublicKey) -> FdoResult<bool> {
        if self.pk_type != other.pk_type {
            return Ok(false);
        }
        let ours = self.to_pkey()?;
        let theirs = other.to_pkey()?;
        Ok(ours.public_eq(&theirs))
    }
}

impl Serialize for FdoPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.pk_type)?;
        tuple.serialize_element(&self.encoding())?;
        match &self.body {
            PublicKeyBody::Crypto(der) | PublicKeyBody::X509(der) => {
                tuple.serialize_element(Bytes::new(der))?;
            }
            PublicKeyBody::X5Chain(chain) => {
                let certs: Vec<&Bytes> = chain.iter().map(|der| Bytes::new(der)).collect();
                tuple.serialize_element(&certs)?;
            }
            PublicKeyBody::CoseKey(value) => tuple.serialize_element(value)?,
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for FdoPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (pk_type, encoding, body): (PublicKeyType, PublicKeyEncoding, Value) =
            Deserialize::deserialize(deserializer)?;
        let body = match (encoding, body) {
            (PublicKeyEncoding::Crypto, Value::Bytes(der)) => PublicKeyBody::Crypto(der),
            (PublicKeyEncoding::X509, Value::Bytes(der)) => PublicKeyBody::X509(der),
            (PublicKeyEncoding::X5Chain, Value::Array(items)) => {
                let chain = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Bytes(der) => Ok(der),
                        _ => Err(D::Error::custom("X5Chain entries must be byte strings")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                PublicKeyBody::X5Chain(chain)
            }
            (PublicKeyEncoding::CoseKey, value @ Value::Map(_)) => PublicKeyBody::CoseKey(value),
            (encoding, _) => {
                return Err(D::Error::custom(format!(
                    "public key body does not match {encoding:?} encoding"
                )))
            }
        };
        Ok(Self { pk_type, body })
    }
}

/// Private key paired with the signature type it produces
#[derive(Clone)]
pub struct SigningKey {
    key: PKey<Private>,
    sig_type: SigType,
}

impl SigningKey {
    /// Pair a key with its signature type
    pub fn new(key: PKey<Private>, sig_type: SigType) -> Self {
        Self { key, sig_type }
    }

    /// Generate a fresh key for `sig_type`
    pub fn generate(sig_type: SigType) -> FdoResult<Self> {
        let key = match sig_type {
            SigType::StSecp256r1 => generate_ec(Nid::X9_62_PRIME256V1)?,
            SigType::StSecp384r1 => generate_ec(Nid::SECP384R1)?,
            SigType::StRsa2048 => generate_rsa(2048)?,
            SigType::StRsa3072 => generate_rsa(3072)?,
            SigType::StEpid10 | SigType::StEpid11 => {
                return Err(FdoError::unsupported(format!(
                    "{sig_type:?} keys cannot be generated"
                )))
            }
        };
        Ok(Self::new(key, sig_type))
    }

    /// Parse a DER private key (PKCS#8, SEC1 or PKCS#1)
    pub fn from_der(der: &[u8], sig_type: SigType) -> FdoResult<Self> {
        let key = PKey::private_key_from_der(der)
            .map_err(|e| FdoError::malformed(format!("invalid private key: {e}")))?;
        Ok(Self::new(key, sig_type))
    }

    /// Signature type this key produces
    pub fn sig_type(&self) -> SigType {
        self.sig_type
    }

    /// Underlying OpenSSL key
    pub fn pkey(&self) -> &PKeyRef<Private> {
        &self.key
    }

    /// Public half as a SubjectPublicKeyInfo-encoded FDO key
    pub fn public_key(&self) -> FdoResult<FdoPublicKey> {
        FdoPublicKey::from_pkey(self.sig_type.public_key_type()?, &self.key)
    }

    /// Sign `payload` as a COSE_Sign1 with this key's signature type
    pub fn sign(
        &self,
        payload: &[u8],
        protected: ProtectedHeader,
        unprotected: UnprotectedHeader,
    ) -> FdoResult<CoseSignature> {
        crate::cose::sign(payload, protected, unprotected, &self.key, self.sig_type)
    }
}

fn generate_ec(curve: Nid) -> FdoResult<PKey<Private>> {
    let group = EcGroup::from_curve_name(curve).map_err(backend("load curve"))?;
    let key = EcKey::generate(&group).map_err(backend("generate EC key"))?;
    PKey::from_ec_key(key).map_err(backend("wrap EC key"))
}

fn generate_rsa(bits: u32) -> FdoResult<PKey<Private>> {
    let key = Rsa::generate(bits).map_err(backend("generate RSA key"))?;
    PKey::from_rsa(key).map_err(backend("wrap RSA key"))
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("sig_type", &self.sig_type)
            .field("bits", &self.key.bits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdo_core::codec;
    use openssl::pkey::Id;

    #[test]
    fn test_crypto_encoding_layout() {
        let key = SigningKey::generate(SigType::StSecp256r1).unwrap();
        let public = key.public_key().unwrap();
        assert_eq!(public.encoding(), PublicKeyEncoding::Crypto);

        let bytes = codec::to_vec(&public).unwrap();
        assert_eq!(&bytes[..3], &[0x83, 0x0a, 0x00]);
        let decoded: FdoPublicKey = codec::from_slice(&bytes).unwrap();
        assert_eq!(decoded, public);
        assert!(decoded.same_key(&public).unwrap());
    }

    #[test]
    fn test_x5chain_decodes_as_list() {
        let public = FdoPublicKey {
            pk_type: PublicKeyType::Secp384r1,
            body: PublicKeyBody::X5Chain(vec![vec![1, 2], vec![3]]),
        };
        let bytes = codec::to_vec(&public).unwrap();
        let decoded: FdoPublicKey = codec::from_slice(&bytes).unwrap();
        assert_eq!(decoded.encoding(), PublicKeyEncoding::X5Chain);
        assert_eq!(decoded, public);
    }

    #[test]
    fn test_body_encoding_mismatch_rejected() {
        let bytes = codec::to_vec(&(10i64, 2i64, serde_bytes::ByteBuf::from(vec![1u8]))).unwrap();
        assert!(codec::from_slice::<FdoPublicKey>(&bytes).is_err());
    }

    #[test]
    fn test_generate_matches_sig_type() {
        let key = SigningKey::generate(SigType::StSecp384r1).unwrap();
        assert_eq!(key.pkey().id(), Id::EC);
        assert_eq!(key.public_key().unwrap().pk_type, PublicKeyType::Secp384r1);
        assert!(SigningKey::generate(SigType::StEpid11).is_err());
    }

    #[test]
    fn test_der_round_trip() {
        let key = SigningKey::generate(SigType::StSecp256r1).unwrap();
        let der = key.pkey().private_key_to_der().unwrap();
        let parsed = SigningKey::from_der(&der, SigType::StSecp256r1).unwrap();
        assert!(parsed.public_key().unwrap().same_key(&key.public_key().unwrap()).unwrap());
    }

    #[test]
    fn test_sig_type_families() {
        assert_eq!(SigType::StRsa3072.public_key_type().unwrap(), PublicKeyType::RsaPkcs);
        assert!(matches!(
            SigType::StEpid10.public_key_type(),
            Err(FdoError::UnsupportedAlgorithm { .. })
        ));
        assert_eq!(SigType::try_from(-35).unwrap(), SigType::StSecp384r1);
    }

    #[test]
    fn test_cose_key_unsupported_for_verification() {
        let public = FdoPublicKey {
            pk_type: PublicKeyType::Secp256r1,
            body: PublicKeyBody::CoseKey(Value::Map(Default::default())),
        };
        assert!(matches!(
            public.to_pkey(),
            Err(FdoError::UnsupportedAlgorithm { .. })
        ));
    }
}
