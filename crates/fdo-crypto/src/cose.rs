//! COSE_Sign1 signing and verification
//!
//! Signatures are computed over the `Sig_structure`
//!
//! ```text
//! ["Signature1", protected, h'', payload]
//! ```
//!
//! ECDSA signatures use the fixed-width `r || s` form (64 bytes for P-256, 96
//! bytes for P-384). RSA signatures are PKCS#1 v1.5 with the digest chosen by
//! the modulus size.

use std::collections::BTreeMap;

use fdo_core::{cbor_array, codec, FdoError, FdoResult, Nonce};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};
use serde_cbor::Value;

use crate::backend;
use crate::cert_chain::validate_chain;
use crate::keys::{FdoPublicKey, PublicKeyBody, PublicKeyType, SigType};

/// Header labels used in FDO COSE structures
pub mod label {
    /// Algorithm (protected)
    pub const ALG: i64 = 1;
    /// Key identifier (protected)
    pub const KID: i64 = 4;
    /// Initialization vector
    pub const IV: i64 = 5;
    /// NonceTO2ProveDv in ProveOVHdr
    pub const CUPH_NONCE: i64 = 256;
    /// Owner public key in ProveOVHdr
    pub const CUPH_OWNER_PUB_KEY: i64 = 257;
    /// MAROE prefix in device attestation
    pub const EAT_MAROE_PREFIX: i64 = -258;
    /// NonceTO2SetupDv in ProveDevice
    pub const EUPH_NONCE: i64 = -259;
}

/// Signed header parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectedHeader {
    /// Algorithm identifier
    pub alg: Option<i64>,
    /// Key identifier
    pub kid: Option<Vec<u8>>,
    /// Initialization vector
    pub iv: Option<Vec<u8>>,
}

impl ProtectedHeader {
    /// Header naming only an algorithm
    pub fn with_alg(alg: i64) -> Self {
        Self {
            alg: Some(alg),
            ..Self::default()
        }
    }

    /// Encode as the byte string placed in the COSE structure
    pub fn to_bytes(&self) -> FdoResult<Vec<u8>> {
        let mut map = BTreeMap::new();
        if let Some(alg) = self.alg {
            map.insert(Value::Integer(label::ALG.into()), Value::Integer(alg.into()));
        }
        if let Some(kid) = &self.kid {
            map.insert(Value::Integer(label::KID.into()), Value::Bytes(kid.clone()));
        }
        if let Some(iv) = &self.iv {
            map.insert(Value::Integer(label::IV.into()), Value::Bytes(iv.clone()));
        }
        codec::to_vec(&Value::Map(map))
    }

    /// Decode from the protected byte string; empty means no parameters
    pub fn from_bytes(bytes: &[u8]) -> FdoResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let Value::Map(map) = codec::from_slice::<Value>(bytes)? else {
            return Err(FdoError::malformed("protected header is not a map"));
        };

        let mut header = Self::default();
        for (key, value) in map {
            match (key, value) {
                (Value::Integer(l), Value::Integer(alg)) if l == label::ALG.into() => {
                    header.alg = Some(
                        i64::try_from(alg)
                            .map_err(|_| FdoError::malformed("algorithm id out of range"))?,
                    );
                }
                (Value::Integer(l), Value::Bytes(kid)) if l == label::KID.into() => header.kid = Some(kid),
                (Value::Integer(l), Value::Bytes(iv)) if l == label::IV.into() => header.iv = Some(iv),
                (Value::Integer(l), _) if [label::ALG, label::KID, label::IV].map(i128::from).contains(&l) => {
                    return Err(FdoError::malformed(format!(
                        "protected header label {l} has the wrong type"
                    )));
                }
                _ => {}
            }
        }
        Ok(header)
    }
}

/// Unsigned header parameters used by TO2
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnprotectedHeader {
    /// Initialization vector (COSE_Encrypt0)
    pub iv: Option<Vec<u8>>,
    /// `CUPHNonce`: NonceTO2ProveDv chosen by the owner
    pub cuph_nonce: Option<Nonce>,
    /// `CUPHOwnerPubKey`: key the owner signed ProveOVHdr with
    pub cuph_owner_pub_key: Option<FdoPublicKey>,
    /// `EATMAROEPrefix`
    pub eat_maroe_prefix: Option<Vec<u8>>,
    /// `EUPHNonce`: NonceTO2SetupDv chosen by the device
    pub euph_nonce: Option<Nonce>,
}

impl Serialize for UnprotectedHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = [
            self.iv.is_some(),
            self.cuph_nonce.is_some(),
            self.cuph_owner_pub_key.is_some(),
            self.eat_maroe_prefix.is_some(),
            self.euph_nonce.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();

        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(iv) = &self.iv {
            map.serialize_entry(&label::IV, Bytes::new(iv))?;
        }
        if let Some(nonce) = &self.cuph_nonce {
            map.serialize_entry(&label::CUPH_NONCE, nonce)?;
        }
        if let Some(key) = &self.cuph_owner_pub_key {
            map.serialize_entry(&label::CUPH_OWNER_PUB_KEY, key)?;
        }
        if let Some(prefix) = &self.eat_maroe_prefix {
            map.serialize_entry(&label::EAT_MAROE_PREFIX, Bytes::new(prefix))?;
        }
        if let Some(nonce) = &self.euph_nonce {
            map.serialize_entry(&label::EUPH_NONCE, nonce)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for UnprotectedHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<Value, Value>::deserialize(deserializer)?;
        let mut header = Self::default();
        for (key, value) in map {
            let Value::Integer(key) = key else {
                continue;
            };
            let Ok(key) = i64::try_from(key) else {
                continue;
            };
            match key {
                label::IV => header.iv = Some(bytes_value(value).map_err(D::Error::custom)?),
                label::CUPH_NONCE => {
                    header.cuph_nonce = Some(nonce_value(value).map_err(D::Error::custom)?);
                }
                label::CUPH_OWNER_PUB_KEY => {
                    header.cuph_owner_pub_key =
                        Some(codec::from_value(value).map_err(D::Error::custom)?);
                }
                label::EAT_MAROE_PREFIX => {
                    header.eat_maroe_prefix = Some(bytes_value(value).map_err(D::Error::custom)?);
                }
                label::EUPH_NONCE => {
                    header.euph_nonce = Some(nonce_value(value).map_err(D::Error::custom)?);
                }
                _ => {}
            }
        }
        Ok(header)
    }
}

fn bytes_value(value: Value) -> FdoResult<Vec<u8>> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        _ => Err(FdoError::malformed("header value must be a byte string")),
    }
}

fn nonce_value(value: Value) -> FdoResult<Nonce> {
    Nonce::from_slice(&bytes_value(value)?)
}

cbor_array! {
    /// `COSE_Sign1`: `[protected, unprotected, payload, signature]`
    ///
    /// Constructed by [`sign`] or decoded from the wire; never mutated.
    #[derive(Debug, Clone, PartialEq)]
    pub struct CoseSignature {
        protected: ByteBuf,
        unprotected: UnprotectedHeader,
        payload: ByteBuf,
        signature: ByteBuf,
    }
}

impl CoseSignature {
    /// Assemble from already encoded parts
    pub fn from_parts(
        protected: Vec<u8>,
        unprotected: UnprotectedHeader,
        payload: Vec<u8>,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            protected: ByteBuf::from(protected),
            unprotected,
            payload: ByteBuf::from(payload),
            signature: ByteBuf::from(signature),
        }
    }

    /// Serialized protected header
    pub fn protected_bytes(&self) -> &[u8] {
        &self.protected
    }

    /// Decoded protected header
    pub fn protected_header(&self) -> FdoResult<ProtectedHeader> {
        ProtectedHeader::from_bytes(&self.protected)
    }

    /// Unprotected header
    pub fn unprotected(&self) -> &UnprotectedHeader {
        &self.unprotected
    }

    /// Signed payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Raw signature
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Decode the payload as a CBOR structure
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> FdoResult<T> {
        codec::from_slice(&self.payload)
    }
}

/// Build the `Sig_structure` bytes covered by a COSE_Sign1 signature
pub fn build_sig_payload(protected: &[u8], payload: &[u8]) -> FdoResult<Vec<u8>> {
    codec::to_vec(&(
        "Signature1",
        Bytes::new(protected),
        Bytes::new(&[]),
        Bytes::new(payload),
    ))
}

/// Sign `payload`, filling the protected algorithm from `sig_type`
pub fn sign(
    payload: &[u8],
    protected: ProtectedHeader,
    unprotected: UnprotectedHeader,
    key: &PKeyRef<Private>,
    sig_type: SigType,
) -> FdoResult<CoseSignature> {
    let declared = protected.alg;
    let protected = match declared {
        None => ProtectedHeader {
            alg: Some(sig_type.id()),
            ..protected
        },
        Some(alg) if alg == sig_type.id() => protected,
        Some(alg) => {
            return Err(FdoError::malformed(format!(
                "protected algorithm {alg} disagrees with {sig_type:?}"
            )))
        }
    };
    let protected_bytes = protected.to_bytes()?;
    let to_be_signed = build_sig_payload(&protected_bytes, payload)?;

    let signature = match sig_type {
        SigType::StSecp256r1 => sign_ecdsa(&to_be_signed, key, Nid::X9_62_PRIME256V1, 32)?,
        SigType::StSecp384r1 => sign_ecdsa(&to_be_signed, key, Nid::SECP384R1, 48)?,
        SigType::StRsa2048 => sign_rsa(&to_be_signed, key, 2048, MessageDigest::sha256())?,
        SigType::StRsa3072 => sign_rsa(&to_be_signed, key, 3072, MessageDigest::sha384())?,
        SigType::StEpid10 | SigType::StEpid11 => {
            return Err(FdoError::unsupported(format!(
                "{sig_type:?} signing is not implemented"
            )))
        }
    };

    Ok(CoseSignature::from_parts(
        protected_bytes,
        unprotected,
        payload.to_vec(),
        signature,
    ))
}

/// Verify a COSE_Sign1 against an FDO public key
///
/// X5Chain keys are path-validated first and the leaf key is used.
pub fn verify(cose: &CoseSignature, public_key: &FdoPublicKey) -> FdoResult<()> {
    let protected = cose.protected_header()?;
    if let Some(alg) = protected.alg {
        check_algorithm(alg, public_key.pk_type)?;
    }

    let pkey = match &public_key.body {
        PublicKeyBody::X5Chain(chain) => validate_chain(chain.as_slice())?.leaf_public_key()?,
        _ => public_key.to_pkey()?,
    };

    let to_be_signed = build_sig_payload(cose.protected_bytes(), cose.payload())?;
    verify_signature(
        &to_be_signed,
        cose.signature(),
        &pkey,
        public_key.pk_type,
        protected.alg,
    )
}

/// Verify with a leaf-first DER certificate chain
pub fn verify_with_chain<C: AsRef<[u8]>>(
    cose: &CoseSignature,
    pk_type: PublicKeyType,
    chain: &[C],
) -> FdoResult<()> {
    let certs = chain.iter().map(|der| der.as_ref().to_vec()).collect();
    verify(
        cose,
        &FdoPublicKey {
            pk_type,
            body: PublicKeyBody::X5Chain(certs),
        },
    )
}

fn check_algorithm(alg: i64, pk_type: PublicKeyType) -> FdoResult<()> {
    let sig_type = SigType::try_from(alg)?;
    let expected = sig_type.public_key_type()?;
    if expected != pk_type {
        return Err(FdoError::verification(format!(
            "{sig_type:?} signature cannot come from a {pk_type:?} key"
        )));
    }
    Ok(())
}

fn sign_ecdsa(data: &[u8], key: &PKeyRef<Private>, curve: Nid, width: usize) -> FdoResult<Vec<u8>> {
    let ec_key = key
        .ec_key()
        .map_err(|_| FdoError::malformed("ECDSA signature type requires an EC private key"))?;
    if ec_key.group().curve_name() != Some(curve) {
        return Err(FdoError::malformed(format!(
            "EC key is not on the {} curve",
            curve.short_name().unwrap_or("expected")
        )));
    }

    let digest = hash(ecdsa_digest(width), data).map_err(backend("hash Sig_structure"))?;
    let signature = EcdsaSig::sign(&digest, &ec_key).map_err(backend("ECDSA sign"))?;

    let mut raw = signature
        .r()
        .to_vec_padded(width as i32)
        .map_err(backend("encode r"))?;
    raw.extend(
        signature
            .s()
            .to_vec_padded(width as i32)
            .map_err(backend("encode s"))?,
    );
    Ok(raw)
}

fn sign_rsa(
    data: &[u8],
    key: &PKeyRef<Private>,
    bits: u32,
    digest: MessageDigest,
) -> FdoResult<Vec<u8>> {
    if key.id() != Id::RSA {
        return Err(FdoError::malformed("RSA signature type requires an RSA private key"));
    }
    if key.bits() != bits {
        return Err(FdoError::malformed(format!(
            "RSA key has a {}-bit modulus, expected {bits}",
            key.bits()
        )));
    }

    let mut signer = Signer::new(digest, key).map_err(backend("RSA signer"))?;
    signer.update(data).map_err(backend("RSA sign"))?;
    signer.sign_to_vec().map_err(backend("RSA sign"))
}

fn verify_signature<T: HasPublic>(
    data: &[u8],
    signature: &[u8],
    key: &PKeyRef<T>,
    pk_type: PublicKeyType,
    alg: Option<i64>,
) -> FdoResult<()> {
    match pk_type {
        PublicKeyType::Secp256r1 => verify_ecdsa(data, signature, key, Nid::X9_62_PRIME256V1, 32),
        PublicKeyType::Secp384r1 => verify_ecdsa(data, signature, key, Nid::SECP384R1, 48),
        PublicKeyType::RsaPkcs => verify_rsa(data, signature, key, alg),
        PublicKeyType::Rsa2048Restr | PublicKeyType::RsaPss => Err(FdoError::unsupported(format!(
            "{pk_type:?} verification is not implemented"
        ))),
    }
}

fn verify_ecdsa<T: HasPublic>(
    data: &[u8],
    signature: &[u8],
    key: &PKeyRef<T>,
    curve: Nid,
    width: usize,
) -> FdoResult<()> {
    if signature.len() != 2 * width {
        return Err(FdoError::malformed(format!(
            "ECDSA signature must be {} bytes, got {}",
            2 * width,
            signature.len()
        )));
    }

    let ec_key = key
        .ec_key()
        .map_err(|_| FdoError::verification("public key is not an EC key"))?;
    if ec_key.group().curve_name() != Some(curve) {
        return Err(FdoError::verification("public key curve does not match pkType"));
    }

    let (r, s) = signature.split_at(width);
    let r = BigNum::from_slice(r).map_err(backend("load r"))?;
    let s = BigNum::from_slice(s).map_err(backend("load s"))?;
    let signature = EcdsaSig::from_private_components(r, s).map_err(backend("ECDSA signature"))?;

    let digest = hash(ecdsa_digest(width), data).map_err(backend("hash Sig_structure"))?;
    match signature.verify(&digest, &ec_key) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(FdoError::verification("ECDSA signature mismatch")),
    }
}

fn verify_rsa<T: HasPublic>(
    data: &[u8],
    signature: &[u8],
    key: &PKeyRef<T>,
    alg: Option<i64>,
) -> FdoResult<()> {
    if key.id() != Id::RSA {
        return Err(FdoError::verification("public key is not an RSA key"));
    }
    let (sig_type, digest) = match key.bits() {
        2048 => (SigType::StRsa2048, MessageDigest::sha256()),
        3072 => (SigType::StRsa3072, MessageDigest::sha384()),
        bits => {
            return Err(FdoError::unsupported(format!(
                "{bits}-bit RSA keys are not supported"
            )))
        }
    };
    if let Some(alg) = alg.filter(|alg| *alg != sig_type.id()) {
        return Err(FdoError::verification(format!(
            "algorithm {alg} does not match a {}-bit RSA key",
            key.bits()
        )));
    }

    let mut verifier = Verifier::new(digest, key).map_err(backend("RSA verifier"))?;
    verifier.update(data).map_err(backend("RSA verify"))?;
    match verifier.verify(signature) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(FdoError::verification("RSA signature mismatch")),
    }
}

fn ecdsa_digest(width: usize) -> MessageDigest {
    if width == 48 {
        MessageDigest::sha384()
    } else {
        MessageDigest::sha256()
    }
}

/// Decode a `COSE_Sign1` from CBOR, rejecting anything else
pub fn decode_signature(bytes: &[u8]) -> FdoResult<CoseSignature> {
    codec::from_slice(bytes)
}
