//! Ownership voucher fixtures

use fdo_core::{Guid, PROTOCOL_VERSION};
use fdo_crypto::{SigType, SigningKey};
use fdo_to2::voucher::cert_chain_hash;
use fdo_to2::{DeviceCredential, OvHeader, OwnershipVoucher, RendezvousInstr};
use rand::RngCore;
use serde_bytes::ByteBuf;
use zeroize::Zeroizing;

use crate::certs::CertChain;

/// A device, its voucher, and every key along the voucher's chain
pub struct VoucherFixture {
    /// Device GUID
    pub guid: Guid,
    /// Device HMAC secret
    pub hmac_secret: Vec<u8>,
    /// Device attestation key
    pub attestation_key: SigningKey,
    /// Device certificate chain
    pub chain: CertChain,
    /// Manufacturer key named in the voucher header
    pub manufacturer_key: SigningKey,
    /// Owner keys in entry order; the last is the current owner
    pub entry_keys: Vec<SigningKey>,
    /// The voucher
    pub voucher: OwnershipVoucher,
}

impl VoucherFixture {
    /// Builder with one entry and P-256 keys
    pub fn builder() -> VoucherFixtureBuilder {
        VoucherFixtureBuilder::default()
    }

    /// Key of the current owner
    pub fn owner_key(&self) -> &SigningKey {
        self.entry_keys
            .last()
            .unwrap_or(&self.manufacturer_key)
    }

    /// Credential the device was manufactured with
    pub fn credential(&self) -> DeviceCredential {
        DeviceCredential {
            guid: self.guid,
            hmac_secret: Zeroizing::new(self.hmac_secret.clone()),
            attestation_key: self.attestation_key.clone(),
        }
    }
}

/// Options for [`VoucherFixture`]
#[derive(Debug, Clone)]
pub struct VoucherFixtureBuilder {
    entries: usize,
    device_sig_type: SigType,
    owner_sig_type: SigType,
    intermediates: usize,
}

impl Default for VoucherFixtureBuilder {
    fn default() -> Self {
        Self {
            entries: 1,
            device_sig_type: SigType::StSecp256r1,
            owner_sig_type: SigType::StSecp256r1,
            intermediates: 1,
        }
    }
}

impl VoucherFixtureBuilder {
    /// Number of voucher entries
    pub fn entries(mut self, entries: usize) -> Self {
        self.entries = entries;
        self
    }

    /// Device attestation signature type
    pub fn device_sig_type(mut self, sig_type: SigType) -> Self {
        self.device_sig_type = sig_type;
        self
    }

    /// Signature type of every owner along the chain
    pub fn owner_sig_type(mut self, sig_type: SigType) -> Self {
        self.owner_sig_type = sig_type;
        self
    }

    /// Intermediate CAs in the device chain
    pub fn intermediates(mut self, intermediates: usize) -> Self {
        self.intermediates = intermediates;
        self
    }

    /// Generate keys, certify the device and extend the voucher
    pub fn build(self) -> VoucherFixture {
        let guid = Guid::random();
        let mut hmac_secret = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut hmac_secret);

        let attestation_key = SigningKey::generate(self.device_sig_type).expect("device key");
        let chain = CertChain::issue(&attestation_key, self.intermediates);
        let chain_bufs: Vec<ByteBuf> = chain.certs.iter().cloned().map(ByteBuf::from).collect();

        let manufacturer_key = SigningKey::generate(SigType::StSecp256r1).expect("manufacturer key");
        let header = OvHeader {
            prot_ver: PROTOCOL_VERSION,
            guid,
            rv_info: vec![vec![RendezvousInstr {
                variable: 2,
                value: ByteBuf::from(vec![0x19, 0x1f, 0x68]),
            }]],
            device_info: "fdo-testkit device".to_string(),
            public_key: manufacturer_key.public_key().expect("manufacturer public key"),
            dev_cert_chain_hash: Some(cert_chain_hash(&chain_bufs).expect("chain hash")),
        };
        let mut voucher = OwnershipVoucher::new(&header, &hmac_secret, Some(chain.certs.clone()))
            .expect("voucher");

        let mut entry_keys: Vec<SigningKey> = Vec::with_capacity(self.entries);
        for _ in 0..self.entries {
            let next = SigningKey::generate(self.owner_sig_type).expect("owner key");
            let signer = entry_keys.last().unwrap_or(&manufacturer_key);
            voucher
                .extend(signer, next.public_key().expect("owner public key"))
                .expect("extend voucher");
            entry_keys.push(next);
        }

        VoucherFixture {
            guid,
            hmac_secret,
            attestation_key,
            chain,
            manufacturer_key,
            entry_keys,
            voucher,
        }
    }
}
