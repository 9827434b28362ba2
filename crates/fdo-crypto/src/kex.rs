//! Key exchange engine
//!
//! Produces the local half of a TO2 key exchange for a negotiated [`KexSuite`]
//! and derives the shared secret (`ShSe`) once the peer's blob arrives. The engine
//! is pure computation: it never sees sessions or transports, so the owner and the
//! device drive it the same way.
//!
//! ECDH blobs carry a length-prefixed affine point plus a per-party random:
//!
//! ```text
//! len16le(X) || X || len16le(Y) || Y || len16le(random) || random
//! ```
//!
//! and `ShSe = Shx || deviceRandom || ownerRandom` on both sides. DH blobs are the
//! big-endian public value and `ShSe` is the raw DH secret.

use std::cmp::Ordering;
use std::fmt;

use fdo_core::{cbor_array, FdoError, FdoResult, KexSuite};
use openssl::bn::{BigNum, BigNumContext};
use openssl::dh::Dh;
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::nid::Nid;
use openssl::pkey::Params;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::debug;
use zeroize::Zeroize;

use crate::backend;

/// Role of the party deriving the shared secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KexSide {
    /// Device (the "B" party)
    Device,
    /// Owner (the "A" party)
    Owner,
}

/// RFC 3526 MODP groups used by the DH suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhGroup {
    /// 2048-bit group 14
    Id14,
    /// 3072-bit group 15
    Id15,
}

impl DhGroup {
    fn params(self) -> FdoResult<Dh<Params>> {
        let prime = match self {
            Self::Id14 => BigNum::get_rfc3526_prime_2048(),
            Self::Id15 => BigNum::get_rfc3526_prime_3072(),
        }
        .map_err(backend("load DH prime"))?;
        let generator = BigNum::from_u32(2).map_err(backend("DH generator"))?;
        Dh::from_pqg(prime, None, generator).map_err(backend("DH parameters"))
    }
}

/// Curve parameters for an ECDH suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EcdhProfile {
    nid: Nid,
    coordinate_len: usize,
    random_len: usize,
}

impl EcdhProfile {
    fn for_suite(suite: KexSuite) -> Option<Self> {
        match suite {
            KexSuite::Ecdh256 => Some(Self {
                nid: Nid::X9_62_PRIME256V1,
                coordinate_len: 32,
                random_len: 16,
            }),
            KexSuite::Ecdh384 => Some(Self {
                nid: Nid::SECP384R1,
                coordinate_len: 48,
                random_len: 48,
            }),
            _ => None,
        }
    }

    fn blob_len(&self) -> usize {
        6 + 2 * self.coordinate_len + self.random_len
    }

    fn group(&self) -> FdoResult<EcGroup> {
        EcGroup::from_curve_name(self.nid).map_err(backend("load curve"))
    }
}

/// Private material retained between `generate_local` and `derive_shared`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KexLocalState {
    /// DH private exponent and public value, both big-endian
    Dh {
        /// MODP group
        group: DhGroup,
        /// Private exponent
        private: ByteBuf,
        /// Public value `g^x mod p`
        public: ByteBuf,
    },
    /// ECDH private scalar, fixed-width big-endian
    Ecdh {
        /// Private scalar
        scalar: ByteBuf,
    },
}

impl fmt::Debug for KexLocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dh { group, .. } => f.debug_struct("Dh").field("group", group).finish_non_exhaustive(),
            Self::Ecdh { .. } => f.debug_struct("Ecdh").finish_non_exhaustive(),
        }
    }
}

impl Drop for KexLocalState {
    fn drop(&mut self) {
        match self {
            Self::Dh { private, .. } => private.zeroize(),
            Self::Ecdh { scalar } => scalar.zeroize(),
        }
    }
}

cbor_array! {
    /// Local exchange parameters: the blob to send plus the state to keep
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct KexParams {
        /// Suite these parameters were generated for
        pub suite: KexSuite,
        /// Private state, never sent
        pub local: KexLocalState,
        /// Wire blob for the peer (`xAKeyExchange` or `xBKeyExchange`)
        pub exchange: ByteBuf,
    }
}

cbor_array! {
    /// Derived shared secret and the context random fed to the session KDF
    #[derive(Clone, PartialEq, Eq)]
    pub struct SessionKey {
        /// Shared secret `ShSe`
        pub sh_se: ByteBuf,
        /// KDF context random, empty for the DH and ECDH suites
        pub context_rand: ByteBuf,
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("sh_se_len", &self.sh_se.len())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.sh_se.zeroize();
    }
}

/// Generate local key exchange material for `suite`
pub fn generate_local(suite: KexSuite) -> FdoResult<KexParams> {
    match suite {
        KexSuite::DhKexId14 => generate_dh(suite, DhGroup::Id14),
        KexSuite::DhKexId15 => generate_dh(suite, DhGroup::Id15),
        KexSuite::Ecdh256 | KexSuite::Ecdh384 => generate_ecdh(suite),
        KexSuite::AsymKex2048 | KexSuite::AsymKex3072 => Err(FdoError::unsupported(format!(
            "{suite} key exchange is not implemented"
        ))),
    }
}

/// Derive `ShSe` from local parameters and the peer's exchange blob
pub fn derive_shared(
    local: &KexParams,
    suite: KexSuite,
    peer_exchange: &[u8],
    side: KexSide,
) -> FdoResult<SessionKey> {
    if local.suite != suite {
        return Err(FdoError::malformed(format!(
            "local parameters were generated for {}, not {suite}",
            local.suite
        )));
    }

    let sh_se = match (&local.local, suite) {
        (KexLocalState::Dh { group, private, public }, KexSuite::DhKexId14 | KexSuite::DhKexId15) => {
            derive_dh(*group, private, public, peer_exchange)?
        }
        (KexLocalState::Ecdh { scalar }, KexSuite::Ecdh256 | KexSuite::Ecdh384) => {
            let profile = EcdhProfile::for_suite(suite)
                .ok_or_else(|| FdoError::internal("missing ECDH profile"))?;
            derive_ecdh(&profile, scalar, &local.exchange, peer_exchange, side)?
        }
        (_, KexSuite::AsymKex2048 | KexSuite::AsymKex3072) => {
            return Err(FdoError::unsupported(format!(
                "{suite} key exchange is not implemented"
            )))
        }
        _ => {
            return Err(FdoError::malformed(format!(
                "local state does not belong to a {suite} exchange"
            )))
        }
    };

    debug!(%suite, ?side, sh_se_len = sh_se.len(), "derived shared secret");
    Ok(SessionKey {
        sh_se: ByteBuf::from(sh_se),
        context_rand: ByteBuf::new(),
    })
}

fn generate_dh(suite: KexSuite, group: DhGroup) -> FdoResult<KexParams> {
    let dh = group
        .params()?
        .generate_key()
        .map_err(backend("generate DH key"))?;
    let public = dh.public_key().to_vec();
    let private = dh.private_key().to_vec();

    Ok(KexParams {
        suite,
        local: KexLocalState::Dh {
            group,
            private: ByteBuf::from(private),
            public: ByteBuf::from(public.clone()),
        },
        exchange: ByteBuf::from(public),
    })
}

fn derive_dh(group: DhGroup, private: &[u8], public: &[u8], peer: &[u8]) -> FdoResult<Vec<u8>> {
    let params = group.params()?;
    let peer_value = BigNum::from_slice(peer).map_err(backend("parse DH peer value"))?;

    let one = BigNum::from_u32(1).map_err(backend("DH bound"))?;
    let mut upper = BigNum::new().map_err(backend("DH bound"))?;
    upper
        .checked_sub(params.prime_p(), &one)
        .map_err(backend("DH bound"))?;
    if peer_value.ucmp(&one) != Ordering::Greater || peer_value.ucmp(&upper) != Ordering::Less {
        return Err(FdoError::malformed("DH peer value is outside (1, p-1)"));
    }

    let public = BigNum::from_slice(public).map_err(backend("load DH public value"))?;
    let private = BigNum::from_slice(private).map_err(backend("load DH private value"))?;
    let dh = params
        .set_key(public, private)
        .map_err(backend("restore DH key"))?;
    dh.compute_key(&peer_value)
        .map_err(backend("compute DH secret"))
}

fn generate_ecdh(suite: KexSuite) -> FdoResult<KexParams> {
    let profile =
        EcdhProfile::for_suite(suite).ok_or_else(|| FdoError::internal("missing ECDH profile"))?;
    let group = profile.group()?;
    let key = EcKey::generate(&group).map_err(backend("generate ECDH key"))?;

    let mut ctx = BigNumContext::new().map_err(backend("bignum context"))?;
    let mut x = BigNum::new().map_err(backend("bignum"))?;
    let mut y = BigNum::new().map_err(backend("bignum"))?;
    key.public_key()
        .affine_coordinates_gfp(&group, &mut x, &mut y, &mut ctx)
        .map_err(backend("read ECDH public point"))?;

    let width = profile.coordinate_len as i32;
    let x = x.to_vec_padded(width).map_err(backend("encode X"))?;
    let y = y.to_vec_padded(width).map_err(backend("encode Y"))?;
    let scalar = key
        .private_key()
        .to_vec_padded(width)
        .map_err(backend("encode scalar"))?;

    let mut random = vec![0u8; profile.random_len];
    rand::rngs::OsRng.fill_bytes(&mut random);

    Ok(KexParams {
        suite,
        local: KexLocalState::Ecdh {
            scalar: ByteBuf::from(scalar),
        },
        exchange: ByteBuf::from(encode_ecdh_blob(&x, &y, &random)),
    })
}

fn derive_ecdh(
    profile: &EcdhProfile,
    scalar: &[u8],
    own_blob: &[u8],
    peer_blob: &[u8],
    side: KexSide,
) -> FdoResult<Vec<u8>> {
    let own = EcdhBlob::parse(profile, own_blob)?;
    let peer = EcdhBlob::parse(profile, peer_blob)?;

    let group = profile.group()?;
    let mut ctx = BigNumContext::new().map_err(backend("bignum context"))?;

    let peer_point = point_from_coordinates(&group, peer.x, peer.y, &mut ctx)?;
    let peer_key = EcKey::from_public_key(&group, &peer_point)
        .map_err(|e| FdoError::malformed(format!("invalid ECDH peer point: {e}")))?;
    peer_key
        .check_key()
        .map_err(|e| FdoError::malformed(format!("ECDH peer point rejected: {e}")))?;

    let d = BigNum::from_slice(scalar).map_err(backend("load scalar"))?;
    let own_point = point_from_coordinates(&group, own.x, own.y, &mut ctx)?;
    let mut expected = EcPoint::new(&group).map_err(backend("ec point"))?;
    expected
        .mul_generator(&group, &d, &ctx)
        .map_err(backend("recompute public point"))?;
    if !expected
        .eq(&group, &own_point, &mut ctx)
        .map_err(backend("compare points"))?
    {
        return Err(FdoError::internal(
            "local ECDH state does not match its exchange blob",
        ));
    }

    let mut shared = EcPoint::new(&group).map_err(backend("ec point"))?;
    shared
        .mul(&group, &peer_point, &d, &ctx)
        .map_err(backend("ECDH multiply"))?;
    let mut shx = BigNum::new().map_err(backend("bignum"))?;
    let mut shy = BigNum::new().map_err(backend("bignum"))?;
    shared
        .affine_coordinates_gfp(&group, &mut shx, &mut shy, &mut ctx)
        .map_err(|e| FdoError::malformed(format!("degenerate shared point: {e}")))?;
    let shx = shx
        .to_vec_padded(profile.coordinate_len as i32)
        .map_err(backend("encode shared X"))?;

    let (device_random, owner_random) = match side {
        KexSide::Device => (own.random, peer.random),
        KexSide::Owner => (peer.random, own.random),
    };

    let mut sh_se = Vec::with_capacity(shx.len() + device_random.len() + owner_random.len());
    sh_se.extend_from_slice(&shx);
    sh_se.extend_from_slice(device_random);
    sh_se.extend_from_slice(owner_random);
    Ok(sh_se)
}

fn point_from_coordinates(
    group: &EcGroup,
    x: &[u8],
    y: &[u8],
    ctx: &mut BigNumContext,
) -> FdoResult<EcPoint> {
    let x = BigNum::from_slice(x).map_err(backend("load X"))?;
    let y = BigNum::from_slice(y).map_err(backend("load Y"))?;
    let mut point = EcPoint::new(group).map_err(backend("ec point"))?;
    point
        .set_affine_coordinates_gfp(group, &x, &y, ctx)
        .map_err(|e| FdoError::malformed(format!("ECDH point is not on the curve: {e}")))?;
    Ok(point)
}

fn encode_ecdh_blob(x: &[u8], y: &[u8], random: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(6 + x.len() + y.len() + random.len());
    for part in [x, y, random] {
        blob.extend_from_slice(&(part.len() as u16).to_le_bytes());
        blob.extend_from_slice(part);
    }
    blob
}

/// Borrowed view of an ECDH exchange blob
struct EcdhBlob<'a> {
    x: &'a [u8],
    y: &'a [u8],
    random: &'a [u8],
}

impl<'a> EcdhBlob<'a> {
    fn parse(profile: &EcdhProfile, blob: &'a [u8]) -> FdoResult<Self> {
        if blob.len() != profile.blob_len() {
            return Err(FdoError::malformed(format!(
                "ECDH exchange must be {} bytes, got {}",
                profile.blob_len(),
                blob.len()
            )));
        }

        let mut rest = blob;
        let mut take = |expected: usize| -> FdoResult<&'a [u8]> {
            let current: &'a [u8] = rest;
            let (prefix, tail) = current.split_at(2);
            let declared = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
            if declared != expected {
                return Err(FdoError::malformed(format!(
                    "ECDH field length {declared}, expected {expected}"
                )));
            }
            let (field, tail) = tail.split_at(expected);
            rest = tail;
            Ok(field)
        };

        let x = take(profile.coordinate_len)?;
        let y = take(profile.coordinate_len)?;
        let random = take(profile.random_len)?;
        Ok(Self { x, y, random })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn exchange(suite: KexSuite) -> (SessionKey, SessionKey) {
        let owner = generate_local(suite).unwrap();
        let device = generate_local(suite).unwrap();
        let owner_key = derive_shared(&owner, suite, &device.exchange, KexSide::Owner).unwrap();
        let device_key = derive_shared(&device, suite, &owner.exchange, KexSide::Device).unwrap();
        (owner_key, device_key)
    }

    #[test]
    fn test_ecdh256_agreement() {
        let (owner, device) = exchange(KexSuite::Ecdh256);
        assert_eq!(owner, device);
        assert_eq!(owner.sh_se.len(), 32 + 16 + 16);
        assert!(owner.context_rand.is_empty());
    }

    #[test]
    fn test_ecdh384_agreement() {
        let (owner, device) = exchange(KexSuite::Ecdh384);
        assert_eq!(owner, device);
        assert_eq!(owner.sh_se.len(), 48 + 48 + 48);
    }

    #[test]
    fn test_dh14_agreement() {
        let (owner, device) = exchange(KexSuite::DhKexId14);
        assert_eq!(owner, device);
        assert!(owner.context_rand.is_empty());
    }

    #[test]
    fn test_dh15_agreement() {
        let (owner, device) = exchange(KexSuite::DhKexId15);
        assert_eq!(owner, device);
        assert!(owner.sh_se.len() <= 384);
        assert!(owner.context_rand.is_empty());
    }

    #[test]
    fn test_blob_lengths() {
        assert_eq!(generate_local(KexSuite::Ecdh256).unwrap().exchange.len(), 86);
        assert_eq!(generate_local(KexSuite::Ecdh384).unwrap().exchange.len(), 150);
    }

    #[test]
    fn test_blob_layout() {
        let params = generate_local(KexSuite::Ecdh256).unwrap();
        let blob = &params.exchange;
        assert_eq!(&blob[0..2], &[32, 0]);
        assert_eq!(&blob[34..36], &[32, 0]);
        assert_eq!(&blob[68..70], &[16, 0]);
    }

    #[test]
    fn test_shared_secret_ordering() {
        let owner = generate_local(KexSuite::Ecdh256).unwrap();
        let device = generate_local(KexSuite::Ecdh256).unwrap();
        let key = derive_shared(&owner, KexSuite::Ecdh256, &device.exchange, KexSide::Owner).unwrap();

        assert_eq!(&key.sh_se[32..48], &device.exchange[70..86]);
        assert_eq!(&key.sh_se[48..64], &owner.exchange[70..86]);
    }

    fn rejects_length(suite: KexSuite, expected: usize, len: usize) -> Result<(), TestCaseError> {
        let owner = generate_local(suite).unwrap();
        let err = derive_shared(&owner, suite, &vec![0x5a; len], KexSide::Owner).unwrap_err();
        let is_malformed = matches!(err, FdoError::MalformedInput { .. });
        prop_assert!(is_malformed);
        prop_assert!(err.message().contains(&expected.to_string()));
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_ecdh256_wrong_length_rejected(len in (0..400usize).prop_filter("exact", |len| *len != 86)) {
            rejects_length(KexSuite::Ecdh256, 86, len)?;
        }

        #[test]
        fn test_ecdh384_wrong_length_rejected(len in (0..400usize).prop_filter("exact", |len| *len != 150)) {
            rejects_length(KexSuite::Ecdh384, 150, len)?;
        }
    }

    #[test]
    fn test_off_curve_point_rejected() {
        let owner = generate_local(KexSuite::Ecdh256).unwrap();
        let mut peer = generate_local(KexSuite::Ecdh256).unwrap().exchange.into_vec();
        peer[40] ^= 0x01;
        let err = derive_shared(&owner, KexSuite::Ecdh256, &peer, KexSide::Owner).unwrap_err();
        assert!(matches!(err, FdoError::MalformedInput { .. }));
    }

    #[test]
    fn test_dh_degenerate_peer_rejected() {
        let owner = generate_local(KexSuite::DhKexId14).unwrap();
        let err = derive_shared(&owner, KexSuite::DhKexId14, &[1], KexSide::Owner).unwrap_err();
        assert!(matches!(err, FdoError::MalformedInput { .. }));
    }

    #[test]
    fn test_asymkex_unsupported() {
        assert!(matches!(
            generate_local(KexSuite::AsymKex2048),
            Err(FdoError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_suite_mismatch_rejected() {
        let owner = generate_local(KexSuite::Ecdh256).unwrap();
        let device = generate_local(KexSuite::Ecdh384).unwrap();
        assert!(derive_shared(&owner, KexSuite::Ecdh384, &device.exchange, KexSide::Owner).is_err());
    }
}
