//! Key fixtures

use fdo_crypto::{SigType, SigningKey};

/// Signature types the engines implement
pub const IMPLEMENTED_SIG_TYPES: [SigType; 4] = [
    SigType::StSecp256r1,
    SigType::StSecp384r1,
    SigType::StRsa2048,
    SigType::StRsa3072,
];

/// Fresh signing key of the given type
pub fn test_key(sig_type: SigType) -> SigningKey {
    SigningKey::generate(sig_type).expect("test key generation")
}
