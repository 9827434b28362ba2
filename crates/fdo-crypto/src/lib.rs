//! FDO Crypto - cryptographic engines for TO2
//!
//! - [`kex`]: DH and ECDH key exchange producing the shared secret `ShSe`
//! - [`cose`]: COSE_Sign1 construction and verification for ECDSA and RSA keys
//! - [`cert_chain`]: leaf-first X.509 path validation for X5Chain keys
//! - [`encryption`]: session key derivation and COSE_Encrypt0 sealing
//! - [`hash`]: SHA-2 digests and HMACs tagged with FDO hash identifiers
//!
//! All engines are synchronous and stateless. OpenSSL supplies the big-number,
//! curve, RSA and certificate primitives.

#![forbid(unsafe_code)]

pub mod cert_chain;
pub mod cose;
pub mod encryption;
pub mod hash;
pub mod kex;
pub mod keys;

pub use cert_chain::{validate_chain, ValidatedChain};
pub use cose::{
    build_sig_payload, sign, verify, verify_with_chain, CoseSignature, ProtectedHeader,
    UnprotectedHeader,
};
pub use encryption::{derive_sek, CoseEncrypt0, SessionCipher};
pub use kex::{derive_shared, generate_local, KexLocalState, KexParams, KexSide, SessionKey};
pub use keys::{FdoPublicKey, PublicKeyBody, PublicKeyEncoding, PublicKeyType, SigType, SigningKey};

use fdo_core::FdoError;
use openssl::error::ErrorStack;

/// Map an OpenSSL failure to an internal error naming the failed step
pub(crate) fn backend(context: &'static str) -> impl FnOnce(ErrorStack) -> FdoError {
    move |err| FdoError::internal(format!("{context}: {err}"))
}
