//! Device side of TO2
//!
//! [`To2Device`] builds each device request and checks each owner reply. It
//! does no I/O; the caller moves [`To2Request`]s and [`To2Response`]s over
//! whatever transport it has.

use fdo_core::{
    codec, CipherSuite, FdoError, FdoResult, Guid, Hash, KexSuite, MessageType, Nonce,
};
use fdo_crypto::cose::{self, ProtectedHeader, UnprotectedHeader};
use fdo_crypto::hash::{verify_digest, verify_hmac};
use fdo_crypto::{
    derive_shared, generate_local, CoseSignature, FdoPublicKey, KexSide, SessionCipher,
    SigningKey,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::messages::{
    self, DeviceServiceInfo, DeviceServiceInfoReady, Done, Done2, EatPayload, GetOvNextEntry,
    HelloDevice, OvNextEntry, OwnerServiceInfo, OwnerServiceInfoReady, ProveOvHdrPayload,
    SetupDevicePayload, SigInfo,
};
use crate::service_info::{negotiated_size, next_chunk, ServiceInfo, ServiceInfoKv, MESSAGE_OVERHEAD};
use crate::transport::{To2Request, To2Response};
use crate::voucher::EntryVerifier;

/// Secrets a device holds from manufacturing
pub struct DeviceCredential {
    /// Device GUID
    pub guid: Guid,
    /// Secret keying the voucher header HMAC
    pub hmac_secret: Zeroizing<Vec<u8>>,
    /// Attestation key, certified by the voucher's device certificate chain
    pub attestation_key: SigningKey,
}

/// Owner parameters learned from ProveOVHdr
struct OwnerProof {
    owner_key: FdoPublicKey,
    nonce_to2_prove_dv: Nonce,
    xa_key_exchange: Vec<u8>,
    num_ov_entries: u8,
    entries: EntryVerifier,
}

/// One TO2 run from the device's point of view
pub struct To2Device {
    credential: DeviceCredential,
    kex_suite: KexSuite,
    cipher_suite: CipherSuite,
    max_owner_service_info_sz: u16,
    service_info: ServiceInfo,

    token: Option<String>,
    nonce_to2_prove_ov: Nonce,
    hello_body: Vec<u8>,
    owner: Option<OwnerProof>,
    nonce_to2_setup_dv: Option<Nonce>,
    cipher: Option<SessionCipher>,
    setup: Option<SetupDevicePayload>,
    max_device_service_info_sz: u16,
    service_info_sent: usize,
    owner_service_info: ServiceInfo,
    complete: bool,
}

impl To2Device {
    /// Start a run with the given suites
    pub fn new(credential: DeviceCredential, kex_suite: KexSuite, cipher_suite: CipherSuite) -> Self {
        Self {
            credential,
            kex_suite,
            cipher_suite,
            max_owner_service_info_sz: negotiated_size(None),
            service_info: Vec::new(),
            token: None,
            nonce_to2_prove_ov: Nonce::random(),
            hello_body: Vec::new(),
            owner: None,
            nonce_to2_setup_dv: None,
            cipher: None,
            setup: None,
            max_device_service_info_sz: negotiated_size(None),
            service_info_sent: 0,
            owner_service_info: Vec::new(),
            complete: false,
        }
    }

    /// Service info to send after SetupDevice
    pub fn with_service_info(mut self, service_info: ServiceInfo) -> Self {
        self.service_info = service_info;
        self
    }

    /// Largest owner service info message to accept
    pub fn with_max_owner_service_info_size(mut self, size: u16) -> Self {
        self.max_owner_service_info_sz = size;
        self
    }

    /// Build a request, encrypting it once the tunnel is up
    ///
    /// The named handlers below cover the normal flow; this is the hook for
    /// sending a body they would not produce.
    pub fn request(&self, message_type: MessageType, body: Vec<u8>) -> FdoResult<To2Request> {
        let body = match (&self.cipher, message_type.is_encrypted()) {
            (Some(cipher), true) => cipher.encrypt(&body)?,
            (None, true) => {
                return Err(FdoError::sequence(format!(
                    "{message_type} needs the encrypted tunnel"
                )))
            }
            (_, false) => body,
        };
        let request = To2Request::new(message_type, body);
        Ok(match &self.token {
            Some(token) => request.with_bearer(token),
            None => request,
        })
    }

    /// Bearer token issued with ProveOVHdr
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// NonceTO2ProveDv received in ProveOVHdr
    pub fn nonce_to2_prove_dv(&self) -> Option<Nonce> {
        self.owner.as_ref().map(|owner| owner.nonce_to2_prove_dv)
    }

    /// Voucher entries announced by the owner
    pub fn num_ov_entries(&self) -> Option<u8> {
        self.owner.as_ref().map(|owner| owner.num_ov_entries)
    }

    /// Index of the next entry to fetch, `None` once all are verified
    pub fn next_entry(&self) -> Option<u8> {
        self.owner
            .as_ref()
            .map(|owner| owner.entries.verified())
            .filter(|verified| Some(*verified) < self.num_ov_entries())
    }

    /// Verified SetupDevice payload
    pub fn setup(&self) -> Option<&SetupDevicePayload> {
        self.setup.as_ref()
    }

    /// Service info received from the owner
    pub fn owner_service_info(&self) -> &[ServiceInfoKv] {
        &self.owner_service_info
    }

    /// Whether Done2 was received and verified
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// TO2.HelloDevice
    pub fn hello_device(&mut self) -> FdoResult<To2Request> {
        let hello = HelloDevice {
            max_device_message_size: 0,
            guid: self.credential.guid,
            nonce_to2_prove_ov: self.nonce_to2_prove_ov,
            kex_suite_name: self.kex_suite.name().to_string(),
            cipher_suite_name: self.cipher_suite.id(),
            ea_sig_info: SigInfo::new(self.credential.attestation_key.sig_type()),
        };
        self.hello_body = codec::to_vec(&hello)?;
        self.request(MessageType::HelloDevice, self.hello_body.clone())
    }

    /// Check TO2.ProveOVHdr
    pub fn process_prove_ov_hdr(&mut self, response: &To2Response) -> FdoResult<()> {
        let body = expect(response, MessageType::ProveOvHdr)?;
        let signed: CoseSignature = messages::decode("ProveOVHdr", body)?;

        let unprotected = signed.unprotected();
        let owner_key = unprotected
            .cuph_owner_pub_key
            .clone()
            .ok_or_else(|| FdoError::malformed("ProveOVHdr carries no CUPHOwnerPubKey"))?;
        let nonce_to2_prove_dv = unprotected
            .cuph_nonce
            .ok_or_else(|| FdoError::malformed("ProveOVHdr carries no CUPHNonce"))?;
        cose::verify(&signed, &owner_key)?;

        let payload: ProveOvHdrPayload = signed.decode_payload()?;
        if !payload.nonce_to2_prove_ov.ct_eq(&self.nonce_to2_prove_ov) {
            return Err(FdoError::sequence("ProveOVHdr does not echo NonceTO2ProveOV"));
        }
        verify_digest(&payload.hello_device_hash, &self.hello_body)?;
        verify_hmac(&payload.hmac, &self.credential.hmac_secret, &payload.ov_header)?;
        if payload.header()?.guid != self.credential.guid {
            return Err(FdoError::verification("voucher header names another device"));
        }
        if payload.eb_sig_info.sig_type != self.credential.attestation_key.sig_type() {
            return Err(FdoError::unsupported(format!(
                "owner expects {:?} attestation",
                payload.eb_sig_info.sig_type
            )));
        }

        self.token = response.bearer_token().map(str::to_string);
        if self.token.is_none() {
            return Err(FdoError::malformed("ProveOVHdr issued no bearer token"));
        }
        self.owner = Some(OwnerProof {
            owner_key,
            nonce_to2_prove_dv,
            xa_key_exchange: payload.xa_key_exchange.into_vec(),
            num_ov_entries: payload.num_ov_entries,
            entries: EntryVerifier::new(&payload.ov_header, &payload.hmac)?,
        });
        debug!(num_ov_entries = payload.num_ov_entries, "owner header verified");
        Ok(())
    }

    /// TO2.GetOVNextEntry
    pub fn get_ov_next_entry(&self, ov_entry_num: u8) -> FdoResult<To2Request> {
        self.request(
            MessageType::GetOvNextEntry,
            codec::to_vec(&GetOvNextEntry { ov_entry_num })?,
        )
    }

    /// Check TO2.OVNextEntry
    ///
    /// After the last entry, the key it names must be the key that signed
    /// ProveOVHdr.
    pub fn process_ov_next_entry(&mut self, response: &To2Response) -> FdoResult<()> {
        let body = expect(response, MessageType::OvNextEntry)?;
        let entry: OvNextEntry = messages::decode("OVNextEntry", body)?;
        let owner = self.owner_mut()?;
        owner.entries.push(entry.ov_entry_num, &entry.ov_entry)?;

        if owner.entries.verified() == owner.num_ov_entries
            && !owner.entries.owner_key().same_key(&owner.owner_key)?
        {
            return Err(FdoError::verification(
                "voucher does not end at the key that signed ProveOVHdr",
            ));
        }
        Ok(())
    }

    /// TO2.ProveDevice
    ///
    /// Completes the key exchange locally; the tunnel is used from the reply on.
    pub fn prove_device(&mut self) -> FdoResult<To2Request> {
        if self.next_entry().is_some() {
            return Err(FdoError::sequence("voucher entries are still outstanding"));
        }
        let owner = self
            .owner
            .as_ref()
            .ok_or_else(|| FdoError::sequence("ProveOVHdr not processed"))?;

        let kex = generate_local(self.kex_suite)?;
        let eat = EatPayload {
            nonce: owner.nonce_to2_prove_dv,
            guid: self.credential.guid,
            xb_key_exchange: kex.exchange.to_vec(),
        };
        let nonce_to2_setup_dv = Nonce::random();
        let signed = self.credential.attestation_key.sign(
            &codec::to_vec(&eat)?,
            ProtectedHeader::default(),
            UnprotectedHeader {
                euph_nonce: Some(nonce_to2_setup_dv),
                ..UnprotectedHeader::default()
            },
        )?;

        let session_key = derive_shared(&kex, self.kex_suite, &owner.xa_key_exchange, KexSide::Device)?;
        let request = self.request(MessageType::ProveDevice, codec::to_vec(&signed)?)?;
        self.cipher = Some(SessionCipher::new(self.cipher_suite, &session_key)?);
        self.nonce_to2_setup_dv = Some(nonce_to2_setup_dv);
        Ok(request)
    }

    /// Check TO2.SetupDevice
    pub fn process_setup_device(&mut self, response: &To2Response) -> FdoResult<()> {
        let body = self.open(response, MessageType::SetupDevice)?;
        let signed: CoseSignature = messages::decode("SetupDevice", &body)?;
        cose::verify(&signed, &self.owner()?.owner_key)?;

        let setup: SetupDevicePayload = signed.decode_payload()?;
        let expected = self
            .nonce_to2_setup_dv
            .ok_or_else(|| FdoError::sequence("ProveDevice not sent"))?;
        if !setup.nonce_to2_setup_dv.ct_eq(&expected) {
            return Err(FdoError::sequence("SetupDevice does not echo NonceTO2SetupDv"));
        }
        self.setup = Some(setup);
        Ok(())
    }

    /// TO2.DeviceServiceInfoReady
    pub fn device_service_info_ready(&self, replacement_hmac: Option<Hash>) -> FdoResult<To2Request> {
        self.request(
            MessageType::DeviceServiceInfoReady,
            codec::to_vec(&DeviceServiceInfoReady {
                replacement_hmac,
                max_owner_service_info_sz: Some(self.max_owner_service_info_sz),
            })?,
        )
    }

    /// Check TO2.OwnerServiceInfoReady
    pub fn process_owner_service_info_ready(&mut self, response: &To2Response) -> FdoResult<()> {
        let body = self.open(response, MessageType::OwnerServiceInfoReady)?;
        let ready: OwnerServiceInfoReady = messages::decode("OwnerServiceInfoReady", &body)?;
        self.max_device_service_info_sz = negotiated_size(ready.max_device_service_info_sz);
        Ok(())
    }

    /// TO2.DeviceServiceInfo carrying the next chunk of device service info
    ///
    /// Once everything was sent this produces empty messages, which is how the
    /// device asks the owner for more.
    pub fn device_service_info(&mut self) -> FdoResult<To2Request> {
        let pending = self
            .service_info
            .get(self.service_info_sent..)
            .unwrap_or_default();
        let budget =
            usize::from(self.max_device_service_info_sz).saturating_sub(MESSAGE_OVERHEAD);
        let (chunk, consumed) = next_chunk(pending, budget)?;
        self.service_info_sent += consumed;

        let message = DeviceServiceInfo {
            is_more_service_info: self.service_info_sent < self.service_info.len(),
            service_info: chunk,
        };
        self.request(MessageType::DeviceServiceInfo, codec::to_vec(&message)?)
    }

    /// Check TO2.OwnerServiceInfo; returns whether the owner is done
    pub fn process_owner_service_info(&mut self, response: &To2Response) -> FdoResult<bool> {
        let body = self.open(response, MessageType::OwnerServiceInfo)?;
        if body.len() > usize::from(self.max_owner_service_info_sz) {
            return Err(FdoError::malformed(format!(
                "OwnerServiceInfo of {} bytes exceeds the announced {}",
                body.len(),
                self.max_owner_service_info_sz
            )));
        }
        let message: OwnerServiceInfo = messages::decode("OwnerServiceInfo", &body)?;
        self.owner_service_info.extend(message.service_info);
        Ok(message.is_done)
    }

    /// TO2.Done
    pub fn done(&self) -> FdoResult<To2Request> {
        let nonce_to2_prove_dv = self.owner()?.nonce_to2_prove_dv;
        self.request(MessageType::Done, codec::to_vec(&Done { nonce_to2_prove_dv })?)
    }

    /// Check TO2.Done2
    pub fn process_done2(&mut self, response: &To2Response) -> FdoResult<()> {
        let body = self.open(response, MessageType::Done2)?;
        let done2: Done2 = messages::decode("Done2", &body)?;
        let expected = self
            .nonce_to2_setup_dv
            .ok_or_else(|| FdoError::sequence("ProveDevice not sent"))?;
        if !done2.nonce_to2_setup_dv.ct_eq(&expected) {
            return Err(FdoError::sequence("Done2 does not echo NonceTO2SetupDv"));
        }
        self.complete = true;
        debug!(guid = %self.credential.guid, "TO2 complete");
        Ok(())
    }

    fn owner(&self) -> FdoResult<&OwnerProof> {
        self.owner
            .as_ref()
            .ok_or_else(|| FdoError::sequence("ProveOVHdr not processed"))
    }

    fn owner_mut(&mut self) -> FdoResult<&mut OwnerProof> {
        self.owner
            .as_mut()
            .ok_or_else(|| FdoError::sequence("ProveOVHdr not processed"))
    }

    fn open(&self, response: &To2Response, message_type: MessageType) -> FdoResult<Vec<u8>> {
        let body = expect(response, message_type)?;
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| FdoError::sequence(format!("{message_type} before the tunnel is up")))?;
        cipher.decrypt(body)
    }
}

fn expect(response: &To2Response, message_type: MessageType) -> FdoResult<&[u8]> {
    if response.is_error() {
        return Err(response.error_message()?.into_error());
    }
    if response.message_type != message_type.id() {
        return Err(FdoError::sequence(format!(
            "expected {message_type}, owner sent message {}",
            response.message_type
        )));
    }
    Ok(&response.body)
}

impl std::fmt::Debug for To2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("To2Device")
            .field("guid", &self.credential.guid)
            .field("kex_suite", &self.kex_suite)
            .field("cipher_suite", &self.cipher_suite)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdo_crypto::SigType;

    fn device() -> To2Device {
        let credential = DeviceCredential {
            guid: Guid::from_bytes([5; 16]),
            hmac_secret: Zeroizing::new(vec![1; 32]),
            attestation_key: SigningKey::generate(SigType::StSecp256r1).unwrap(),
        };
        To2Device::new(credential, KexSuite::Ecdh256, CipherSuite::A128Gcm)
    }

    #[test]
    fn test_hello_has_no_token() {
        let mut device = device();
        let request = device.hello_device().unwrap();
        assert_eq!(request.message_type, 60);
        assert!(request.authorization.is_none());
        let hello: HelloDevice = codec::from_slice(&request.body).unwrap();
        assert_eq!(hello.kex_suite_name, "ECDH256");
        assert_eq!(hello.cipher_suite_name, 1);
    }

    #[test]
    fn test_encrypted_request_needs_tunnel() {
        let device = device();
        assert!(matches!(
            device.request(MessageType::Done, vec![]),
            Err(FdoError::ProtocolSequenceViolation { .. })
        ));
    }

    #[test]
    fn test_prove_device_before_header() {
        let mut device = device();
        assert!(device.prove_device().is_err());
    }

    #[test]
    fn test_owner_error_is_surfaced() {
        let mut device = device();
        device.hello_device().unwrap();
        let response = To2Response::error(&FdoError::unsupported("ASYMKEX2048"), 60, 3);
        let err = device.process_prove_ov_hdr(&response).unwrap_err();
        assert!(err.message().contains("ASYMKEX2048"));
    }

    #[test]
    fn test_wrong_message_type() {
        let mut device = device();
        device.hello_device().unwrap();
        let response = To2Response::ok(MessageType::OvNextEntry, vec![]);
        assert!(matches!(
            device.process_prove_ov_hdr(&response),
            Err(FdoError::ProtocolSequenceViolation { .. })
        ));
    }
}
