//! Ownership vouchers
//!
//! A voucher binds a device to its current owner through a header signed into
//! existence by the manufacturer and a chain of entries, each signed by the
//! previous owner and naming the next one. [`EntryVerifier`] walks that chain one
//! entry at a time, which is how the device consumes `OVNextEntry` messages, and
//! [`OwnershipVoucher::verify_entries`] runs the same walk over a stored voucher.

use fdo_core::{cbor_array, codec, FdoError, FdoResult, Guid, Hash, HashType, PROTOCOL_VERSION};
use fdo_crypto::cose::{self, ProtectedHeader, UnprotectedHeader};
use fdo_crypto::hash::{digest, hmac, verify_hmac};
use fdo_crypto::{CoseSignature, FdoPublicKey, SigningKey};
use serde_bytes::ByteBuf;
use tracing::debug;

cbor_array! {
    /// One rendezvous instruction: `[RVVariable, RVValue]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RendezvousInstr {
        /// Instruction variable number
        pub variable: u8,
        /// CBOR-encoded instruction value
        pub value: ByteBuf,
    }
}

/// Instructions tried together
pub type RendezvousDirective = Vec<RendezvousInstr>;

/// Alternative directives, in preference order
pub type RendezvousInfo = Vec<RendezvousDirective>;

cbor_array! {
    /// Voucher header
    #[derive(Debug, Clone, PartialEq)]
    pub struct OvHeader {
        /// Protocol version
        pub prot_ver: u16,
        /// Device GUID
        pub guid: Guid,
        /// Rendezvous instructions
        pub rv_info: RendezvousInfo,
        /// Manufacturer-assigned device description
        pub device_info: String,
        /// Manufacturer public key, signer of the first entry
        pub public_key: FdoPublicKey,
        /// Digest of the device certificate chain
        pub dev_cert_chain_hash: Option<Hash>,
    }
}

cbor_array! {
    /// Signed content of one voucher entry
    #[derive(Debug, Clone, PartialEq)]
    pub struct OvEntryPayload {
        /// Digest of the previous entry, or of header and HMAC for the first entry
        pub hash_prev_entry: Hash,
        /// Digest of GUID and device info
        pub hash_hdr_info: Hash,
        /// Optional extension data
        pub extra: Option<ByteBuf>,
        /// Public key of the owner this entry transfers to
        pub public_key: FdoPublicKey,
    }
}

cbor_array! {
    /// Ownership voucher: `[OVProtVer, OVHeader, OVHeaderHMac, OVDevCertChain, OVEntries]`
    #[derive(Debug, Clone, PartialEq)]
    pub struct OwnershipVoucher {
        /// Protocol version
        pub prot_ver: u16,
        /// Encoded header, kept as bytes so the HMAC stays verifiable
        pub header: ByteBuf,
        /// HMAC over the encoded header with the device secret
        pub header_hmac: Hash,
        /// Device certificate chain, leaf first
        pub dev_cert_chain: Option<Vec<ByteBuf>>,
        /// Signed entries
        pub entries: Vec<CoseSignature>,
    }
}

/// Digest input for `hash_hdr_info`
fn header_info(header: &OvHeader) -> Vec<u8> {
    let mut info = header.guid.as_bytes().to_vec();
    info.extend_from_slice(header.device_info.as_bytes());
    info
}

/// Digest input for the first entry's `hash_prev_entry`
fn first_entry_input(header_bytes: &[u8], header_hmac: &Hash) -> FdoResult<Vec<u8>> {
    let mut input = header_bytes.to_vec();
    input.extend(codec::to_vec(header_hmac)?);
    Ok(input)
}

/// Digest of a device certificate chain as recorded in the header
pub fn cert_chain_hash(chain: &[ByteBuf]) -> FdoResult<Hash> {
    digest(HashType::Sha256, &codec::to_vec(&chain)?)
}

impl OwnershipVoucher {
    /// Create a voucher with no entries
    ///
    /// `hmac_secret` is the device's HMAC secret; the header HMAC is computed
    /// with HMAC-SHA256.
    pub fn new(
        header: &OvHeader,
        hmac_secret: &[u8],
        dev_cert_chain: Option<Vec<Vec<u8>>>,
    ) -> FdoResult<Self> {
        let header_bytes = codec::to_vec(header)?;
        let header_hmac = hmac(HashType::HmacSha256, hmac_secret, &header_bytes)?;
        Ok(Self {
            prot_ver: PROTOCOL_VERSION,
            header: ByteBuf::from(header_bytes),
            header_hmac,
            dev_cert_chain: dev_cert_chain
                .map(|chain| chain.into_iter().map(ByteBuf::from).collect()),
            entries: Vec::new(),
        })
    }

    /// Decode the header
    pub fn header(&self) -> FdoResult<OvHeader> {
        codec::from_slice(&self.header)
    }

    /// Device GUID from the header
    pub fn guid(&self) -> FdoResult<Guid> {
        Ok(self.header()?.guid)
    }

    /// Number of entries as carried in ProveOVHdr
    pub fn num_entries(&self) -> FdoResult<u8> {
        u8::try_from(self.entries.len())
            .map_err(|_| FdoError::malformed("voucher holds more than 255 entries"))
    }

    /// Entry at `index`
    pub fn entry(&self, index: u8) -> FdoResult<&CoseSignature> {
        self.entries.get(usize::from(index)).ok_or_else(|| {
            FdoError::sequence(format!(
                "entry {index} requested but the voucher has {}",
                self.entries.len()
            ))
        })
    }

    /// Check the header HMAC with the device secret
    pub fn verify_header_hmac(&self, hmac_secret: &[u8]) -> FdoResult<()> {
        verify_hmac(&self.header_hmac, hmac_secret, &self.header)
    }

    /// Public key of the current owner: the last entry's key
    pub fn owner_public_key(&self) -> FdoResult<FdoPublicKey> {
        let last = self
            .entries
            .last()
            .ok_or_else(|| FdoError::malformed("voucher has no entries"))?;
        Ok(last.decode_payload::<OvEntryPayload>()?.public_key)
    }

    /// Append an entry transferring ownership to `next_owner`
    ///
    /// `signer` must hold the key named by the last entry, or the manufacturer
    /// key from the header when the voucher has no entries yet.
    pub fn extend(&mut self, signer: &SigningKey, next_owner: FdoPublicKey) -> FdoResult<()> {
        if self.entries.len() >= usize::from(u8::MAX) {
            return Err(FdoError::malformed("voucher already holds 255 entries"));
        }
        let header = self.header()?;
        let current = match self.entries.last() {
            Some(last) => last.decode_payload::<OvEntryPayload>()?.public_key,
            None => header.public_key.clone(),
        };
        if !current.same_key(&signer.public_key()?)? {
            return Err(FdoError::malformed(
                "signer does not hold the current owner key",
            ));
        }

        let prev_input = match self.entries.last() {
            Some(last) => codec::to_vec(last)?,
            None => first_entry_input(&self.header, &self.header_hmac)?,
        };
        let payload = OvEntryPayload {
            hash_prev_entry: digest(HashType::Sha256, &prev_input)?,
            hash_hdr_info: digest(HashType::Sha256, &header_info(&header))?,
            extra: None,
            public_key: next_owner,
        };

        let entry = signer.sign(
            &codec::to_vec(&payload)?,
            ProtectedHeader::default(),
            UnprotectedHeader::default(),
        )?;
        self.entries.push(entry);
        debug!(entries = self.entries.len(), "voucher extended");
        Ok(())
    }

    /// Verify every entry and return the final owner key
    pub fn verify_entries(&self) -> FdoResult<FdoPublicKey> {
        let mut verifier = EntryVerifier::new(&self.header, &self.header_hmac)?;
        for (index, entry) in self.entries.iter().enumerate() {
            let index = u8::try_from(index)
                .map_err(|_| FdoError::malformed("voucher holds more than 255 entries"))?;
            verifier.push(index, entry)?;
        }
        if verifier.verified() == 0 {
            return Err(FdoError::malformed("voucher has no entries"));
        }
        Ok(verifier.owner_key().clone())
    }

    /// Check the header's certificate chain digest, returning the chain
    pub fn verified_cert_chain(&self) -> FdoResult<&[ByteBuf]> {
        let chain = self
            .dev_cert_chain
            .as_deref()
            .ok_or_else(|| FdoError::malformed("voucher carries no device certificate chain"))?;
        if let Some(expected) = self.header()?.dev_cert_chain_hash {
            let actual = digest(expected.hash_type, &codec::to_vec(&chain)?)?;
            if !actual.ct_eq(&expected) {
                return Err(FdoError::verification(
                    "device certificate chain does not match the voucher header",
                ));
            }
        }
        Ok(chain)
    }
}

/// Incremental verifier for voucher entries
#[derive(Debug, Clone)]
pub struct EntryVerifier {
    header_info: Vec<u8>,
    prev_input: Vec<u8>,
    prev_key: FdoPublicKey,
    verified: u8,
}

impl EntryVerifier {
    /// Start from the encoded header and its HMAC
    pub fn new(header_bytes: &[u8], header_hmac: &Hash) -> FdoResult<Self> {
        let header: OvHeader = codec::from_slice(header_bytes)?;
        Ok(Self {
            header_info: header_info(&header),
            prev_input: first_entry_input(header_bytes, header_hmac)?,
            prev_key: header.public_key,
            verified: 0,
        })
    }

    /// Verify the next entry, which must carry index `index`
    pub fn push(&mut self, index: u8, entry: &CoseSignature) -> FdoResult<&FdoPublicKey> {
        if index != self.verified {
            return Err(FdoError::sequence(format!(
                "expected voucher entry {}, got {index}",
                self.verified
            )));
        }

        cose::verify(entry, &self.prev_key)
            .map_err(|e| annotate(e, &format!("voucher entry {index}")))?;
        let payload: OvEntryPayload = entry.decode_payload()?;

        let expected_prev = digest(payload.hash_prev_entry.hash_type, &self.prev_input)?;
        if !expected_prev.ct_eq(&payload.hash_prev_entry) {
            return Err(FdoError::verification(format!(
                "voucher entry {index} does not chain to its predecessor"
            )));
        }
        let expected_info = digest(payload.hash_hdr_info.hash_type, &self.header_info)?;
        if !expected_info.ct_eq(&payload.hash_hdr_info) {
            return Err(FdoError::verification(format!(
                "voucher entry {index} names a different device"
            )));
        }

        self.prev_input = codec::to_vec(entry)?;
        self.prev_key = payload.public_key;
        self.verified = self
            .verified
            .checked_add(1)
            .ok_or_else(|| FdoError::malformed("voucher holds more than 255 entries"))?;
        Ok(&self.prev_key)
    }

    /// Key named by the last verified entry, or the manufacturer key before any
    pub fn owner_key(&self) -> &FdoPublicKey {
        &self.prev_key
    }

    /// Number of entries verified so far
    pub fn verified(&self) -> u8 {
        self.verified
    }
}

fn annotate(error: FdoError, context: &str) -> FdoError {
    match error {
        FdoError::VerificationFailed { message } => {
            FdoError::verification(format!("{context}: {message}"))
        }
        other => other,
    }
}
