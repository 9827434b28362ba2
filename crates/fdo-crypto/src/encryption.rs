//! Session encryption for TO2 messages 65-71

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce as GcmNonce};
use fdo_core::{cbor_array, codec, CipherSuite, FdoError, FdoResult, HashType};
use rand::RngCore;
use serde_bytes::{ByteBuf, Bytes};
use zeroize::Zeroizing;

use crate::cose::{ProtectedHeader, UnprotectedHeader};
use crate::hash::hmac;
use crate::kex::SessionKey;

/// AES-GCM nonce length
pub const IV_LEN: usize = 12;

const KDF_LABEL: &[u8] = b"FIDO-KDF";
const KDF_CONTEXT: &[u8] = b"AutomaticOnboardTunnel";

cbor_array! {
    /// `COSE_Encrypt0`: `[protected, unprotected, ciphertext]`
    #[derive(Debug, Clone, PartialEq)]
    pub struct CoseEncrypt0 {
        /// Serialized protected header naming the cipher
        pub protected: ByteBuf,
        /// Unprotected header carrying the IV
        pub unprotected: UnprotectedHeader,
        /// Ciphertext with the GCM tag appended
        pub ciphertext: ByteBuf,
    }
}

/// Derive the session encryption key (SP 800-108 counter mode, HMAC PRF)
pub fn derive_sek(suite: CipherSuite, key: &SessionKey) -> FdoResult<Zeroizing<Vec<u8>>> {
    let prf = match suite {
        CipherSuite::A128Gcm => HashType::HmacSha256,
        CipherSuite::A256Gcm => HashType::HmacSha384,
    };
    let key_len = suite.key_len();
    let length_bits = u16::try_from(key_len * 8)
        .map_err(|_| FdoError::internal("session key length overflows the KDF"))?;

    let mut output = Zeroizing::new(Vec::with_capacity(key_len + prf.output_len()));
    let mut counter: u8 = 1;
    while output.len() < key_len {
        let mut input = Vec::with_capacity(1 + KDF_LABEL.len() + 1 + KDF_CONTEXT.len() + 2);
        input.push(counter);
        input.extend_from_slice(KDF_LABEL);
        input.push(0x00);
        input.extend_from_slice(KDF_CONTEXT);
        input.extend_from_slice(&key.context_rand);
        input.extend_from_slice(&length_bits.to_be_bytes());

        let block = hmac(prf, &key.sh_se, &input)?;
        output.extend_from_slice(&block.value);
        counter = counter
            .checked_add(1)
            .ok_or_else(|| FdoError::internal("KDF counter exhausted"))?;
    }
    output.truncate(key_len);
    Ok(output)
}

/// Encrypts and decrypts tunnel messages for one session
pub struct SessionCipher {
    suite: CipherSuite,
    sek: Zeroizing<Vec<u8>>,
}

impl SessionCipher {
    /// Build a cipher from the negotiated suite and shared secret
    pub fn new(suite: CipherSuite, key: &SessionKey) -> FdoResult<Self> {
        Ok(Self {
            suite,
            sek: derive_sek(suite, key)?,
        })
    }

    /// Negotiated suite
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Seal `plaintext` into an encoded `COSE_Encrypt0`
    pub fn encrypt(&self, plaintext: &[u8]) -> FdoResult<Vec<u8>> {
        let protected = ProtectedHeader::with_alg(self.suite.id()).to_bytes()?;
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let aad = enc_structure(&protected)?;
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };
        let nonce = GcmNonce::from_slice(&iv);
        let ciphertext = match self.suite {
            CipherSuite::A128Gcm => Aes128Gcm::new_from_slice(&self.sek)
                .map_err(|e| FdoError::internal(format!("Failed to create cipher: {e}")))?
                .encrypt(nonce, payload),
            CipherSuite::A256Gcm => Aes256Gcm::new_from_slice(&self.sek)
                .map_err(|e| FdoError::internal(format!("Failed to create cipher: {e}")))?
                .encrypt(nonce, payload),
        }
        .map_err(|e| FdoError::internal(format!("Encryption failed: {e}")))?;

        codec::to_vec(&CoseEncrypt0 {
            protected: ByteBuf::from(protected),
            unprotected: UnprotectedHeader {
                iv: Some(iv.to_vec()),
                ..UnprotectedHeader::default()
            },
            ciphertext: ByteBuf::from(ciphertext),
        })
    }

    /// Open an encoded `COSE_Encrypt0`
    pub fn decrypt(&self, message: &[u8]) -> FdoResult<Vec<u8>> {
        let envelope: CoseEncrypt0 = codec::from_slice(message)?;

        let protected = ProtectedHeader::from_bytes(&envelope.protected)?;
        if protected.alg != Some(self.suite.id()) {
            return Err(FdoError::verification(format!(
                "message sealed with algorithm {:?}, session uses {}",
                protected.alg, self.suite
            )));
        }

        let iv = envelope
            .unprotected
            .iv
            .as_deref()
            .ok_or_else(|| FdoError::malformed("COSE_Encrypt0 carries no IV"))?;
        if iv.len() != IV_LEN {
            return Err(FdoError::malformed(format!(
                "IV must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }

        let aad = enc_structure(&envelope.protected)?;
        let payload = Payload {
            msg: envelope.ciphertext.as_slice(),
            aad: &aad,
        };
        let nonce = GcmNonce::from_slice(iv);
        let plaintext = match self.suite {
            CipherSuite::A128Gcm => Aes128Gcm::new_from_slice(&self.sek)
                .map_err(|e| FdoError::internal(format!("Failed to create cipher: {e}")))?
                .decrypt(nonce, payload),
            CipherSuite::A256Gcm => Aes256Gcm::new_from_slice(&self.sek)
                .map_err(|e| FdoError::internal(format!("Failed to create cipher: {e}")))?
                .decrypt(nonce, payload),
        };
        plaintext.map_err(|_| FdoError::verification("message authentication failed"))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

fn enc_structure(protected: &[u8]) -> FdoResult<Vec<u8>> {
    codec::to_vec(&("Encrypt0", Bytes::new(protected), Bytes::new(&[])))
}
