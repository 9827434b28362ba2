//! SHA-2 digests and HMACs tagged with FDO hash identifiers

use fdo_core::{FdoError, FdoResult, Hash, HashType};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

/// Compute a plain digest
pub fn digest(hash_type: HashType, data: &[u8]) -> FdoResult<Hash> {
    let value = match hash_type {
        HashType::Sha256 => Sha256::digest(data).to_vec(),
        HashType::Sha384 => Sha384::digest(data).to_vec(),
        other => {
            return Err(FdoError::malformed(format!(
                "{other:?} is a MAC, not a digest"
            )))
        }
    };
    Ok(Hash::new(hash_type, value))
}

/// Compute a keyed MAC
pub fn hmac(hash_type: HashType, key: &[u8], data: &[u8]) -> FdoResult<Hash> {
    let value = match hash_type {
        HashType::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|e| FdoError::internal(format!("HMAC key rejected: {e}")))?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashType::HmacSha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key)
                .map_err(|e| FdoError::internal(format!("HMAC key rejected: {e}")))?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        other => {
            return Err(FdoError::malformed(format!(
                "{other:?} is a digest, not a MAC"
            )))
        }
    };
    Ok(Hash::new(hash_type, value))
}

/// Check that `expected` is the digest of `data`
pub fn verify_digest(expected: &Hash, data: &[u8]) -> FdoResult<()> {
    let actual = digest(expected.hash_type, data)?;
    if actual.ct_eq(expected) {
        Ok(())
    } else {
        Err(FdoError::verification("digest mismatch"))
    }
}

/// Check that `expected` is the MAC of `data` under `key`
pub fn verify_hmac(expected: &Hash, key: &[u8], data: &[u8]) -> FdoResult<()> {
    let actual = hmac(expected.hash_type, key, data)?;
    if actual.ct_eq(expected) {
        Ok(())
    } else {
        Err(FdoError::verification("HMAC mismatch"))
    }
}
