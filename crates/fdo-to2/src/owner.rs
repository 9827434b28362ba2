//! Owner side of TO2
//!
//! [`To2Owner::handle`] takes one device message and returns one reply. All
//! state between messages lives in the [`SessionStore`]; a handler loads the
//! session, checks that the message is admissible in the current stage,
//! computes the next session and the reply, persists the session and only then
//! builds the response.
//!
//! Any rejection marks the session failed, except a repeated request for a
//! voucher entry that was already delivered and a lost store race. Those are
//! answered with an error but leave the session where it was. Failed sessions
//! stay in the store until they expire so that retries get a sequence
//! violation; a completed session is deleted once Done2 is sealed.

use fdo_core::{
    codec, CipherSuite, FdoError, FdoResult, Guid, HashType, KexSuite, MessageType, Nonce,
};
use fdo_crypto::cose::{self, ProtectedHeader, UnprotectedHeader};
use fdo_crypto::hash::digest;
use fdo_crypto::{
    derive_shared, generate_local, CoseSignature, FdoPublicKey, KexSide, SessionCipher,
    SigningKey,
};
use tracing::{debug, info, warn};

use crate::config::{ConfigValidation, OwnerConfig};
use crate::messages::{
    self, DeviceServiceInfo, DeviceServiceInfoReady, Done, Done2, EatPayload, GetOvNextEntry,
    HelloDevice, OvNextEntry, OwnerServiceInfo, OwnerServiceInfoReady, ProveOvHdrPayload,
    SetupDevicePayload, SigInfo,
};
use crate::service_info::{negotiated_size, next_chunk, ServiceInfo, MESSAGE_OVERHEAD};
use crate::session::{ProtocolSession, To2Stage};
use crate::store::{SessionId, SessionStore, StoreError, VoucherStore};
use crate::transport::{To2Request, To2Response};
use crate::voucher::OwnershipVoucher;

/// Why a message was refused
enum Rejection {
    /// The session cannot continue
    Fatal(FdoError),
    /// The message is refused but the session is untouched
    Stale(FdoError),
}

impl From<FdoError> for Rejection {
    fn from(err: FdoError) -> Self {
        Self::Fatal(err)
    }
}

struct Reply {
    message_type: MessageType,
    body: Vec<u8>,
}

impl Reply {
    fn new<T: serde::Serialize>(message_type: MessageType, body: &T) -> FdoResult<Self> {
        Ok(Self {
            message_type,
            body: codec::to_vec(body)?,
        })
    }
}

/// TO2 owner service
pub struct To2Owner<S, V> {
    config: OwnerConfig,
    owner_key: SigningKey,
    owner_public_key: FdoPublicKey,
    service_info: ServiceInfo,
    sessions: S,
    vouchers: V,
}

impl<S: SessionStore, V: VoucherStore> To2Owner<S, V> {
    /// Create an owner that signs with `owner_key`
    ///
    /// `owner_key` must be the key named by the last entry of every voucher
    /// this owner serves.
    pub fn new(config: OwnerConfig, owner_key: SigningKey, sessions: S, vouchers: V) -> FdoResult<Self> {
        config.validate()?;
        let owner_public_key = owner_key.public_key()?;
        let service_info = config.service_info()?;
        Ok(Self {
            config,
            owner_key,
            owner_public_key,
            service_info,
            sessions,
            vouchers,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &OwnerConfig {
        &self.config
    }

    /// Session store
    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    /// Process one device message
    pub async fn handle(&self, request: To2Request) -> To2Response {
        let prev_msg_id = request.message_type;
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                let correlation_id = rand::random::<u64>();
                warn!(
                    message_type = prev_msg_id,
                    correlation_id,
                    code = err.error_code().code(),
                    error = %err,
                    "TO2 message rejected"
                );
                To2Response::error(&err, prev_msg_id, correlation_id)
            }
        }
    }

    async fn dispatch(&self, request: To2Request) -> FdoResult<To2Response> {
        if request.message_type == MessageType::HelloDevice.id() {
            self.check_envelope(&request)?;
            return self.hello_device(&request.body).await;
        }

        let id = request.session_id()?;
        let session = self.sessions.get(&id).await?;
        let message_type = MessageType::try_from(request.message_type)?;
        if !message_type.is_device_request() {
            return Err(FdoError::sequence(format!(
                "{message_type} is not a device message"
            )));
        }
        self.check_envelope(&request)?;
        if session.failed {
            return Err(FdoError::sequence(format!("session {id} has failed")));
        }
        if session.is_complete() {
            return Err(FdoError::sequence(format!("session {id} is already complete")));
        }

        match self.advance(&session, message_type, &request.body).await {
            Ok((next, reply)) => {
                self.sessions
                    .update(&id, session.revision, &next)
                    .await
                    .map_err(FdoError::from)?;
                info!(
                    session = %id,
                    message_type = %message_type,
                    stage = ?next.stage,
                    "TO2 message accepted"
                );
                let response = self.seal(&next, reply)?.with_bearer(&id);
                if next.is_complete() {
                    self.sessions.delete(&id).await.map_err(FdoError::from)?;
                    debug!(session = %id, "completed session removed");
                }
                Ok(response)
            }
            Err(Rejection::Stale(err)) => Err(err),
            Err(Rejection::Fatal(err)) => {
                self.fail(&id, &session).await;
                Err(err)
            }
        }
    }

    fn check_envelope(&self, request: &To2Request) -> FdoResult<()> {
        request.check_content_type()?;
        let limit = usize::from(self.config.max_owner_message_size);
        if limit > 0 && request.body.len() > limit {
            return Err(FdoError::malformed(format!(
                "message of {} bytes exceeds the owner limit of {limit}",
                request.body.len()
            )));
        }
        Ok(())
    }

    async fn advance(
        &self,
        session: &ProtocolSession,
        message_type: MessageType,
        body: &[u8],
    ) -> Result<(ProtocolSession, Reply), Rejection> {
        if !session.accepts(message_type) {
            return Err(FdoError::sequence(format!(
                "{message_type} is not expected after {:?}",
                session.stage
            ))
            .into());
        }

        let plaintext = if session.tunnel_established() {
            session_cipher(session)?.decrypt(body)?
        } else {
            body.to_vec()
        };

        let mut next = session.next_revision();
        let reply = match message_type {
            MessageType::GetOvNextEntry => self.get_ov_next_entry(&mut next, &plaintext).await?,
            MessageType::ProveDevice => self.prove_device(&mut next, &plaintext).await?,
            MessageType::DeviceServiceInfoReady => {
                device_service_info_ready(&mut next, &plaintext)?
            }
            MessageType::DeviceServiceInfo => self.device_service_info(&mut next, &plaintext)?,
            MessageType::Done => done(&mut next, &plaintext)?,
            other => {
                return Err(FdoError::sequence(format!("{other} is not handled here")).into())
            }
        };
        Ok((next, reply))
    }

    async fn fail(&self, id: &SessionId, session: &ProtocolSession) {
        let mut failed = session.next_revision();
        failed.failed = true;
        if let Err(err) = self.sessions.update(id, session.revision, &failed).await {
            warn!(session = %id, error = %err, "could not mark session failed");
        }
    }

    fn seal(&self, session: &ProtocolSession, reply: Reply) -> FdoResult<To2Response> {
        let body = if reply.message_type.is_encrypted() {
            session_cipher(session)?.encrypt(&reply.body)?
        } else {
            reply.body
        };
        Ok(To2Response::ok(reply.message_type, body))
    }

    async fn voucher(&self, guid: &Guid) -> FdoResult<OwnershipVoucher> {
        self.vouchers.get(guid).await.map_err(|err| match err {
            StoreError::NotFound { .. } => {
                FdoError::malformed(format!("no ownership voucher for device {guid}"))
            }
            other => other.into(),
        })
    }

    async fn hello_device(&self, body: &[u8]) -> FdoResult<To2Response> {
        let hello: HelloDevice = messages::decode("HelloDevice", body)?;

        let kex_suite: KexSuite = hello.kex_suite_name.parse()?;
        if !self.config.supports_kex(kex_suite) {
            return Err(FdoError::unsupported(format!(
                "key exchange {kex_suite} is not offered"
            )));
        }
        let cipher_suite = CipherSuite::try_from(hello.cipher_suite_name)?;
        if !self.config.supports_cipher(cipher_suite) {
            return Err(FdoError::unsupported(format!(
                "cipher suite {cipher_suite} is not offered"
            )));
        }
        let device_sig_type = hello.ea_sig_info.sig_type;
        device_sig_type.public_key_type()?;

        let voucher = self.voucher(&hello.guid).await?;
        let current_owner = voucher.verify_entries()?;
        if !current_owner.same_key(&self.owner_public_key)? {
            return Err(FdoError::verification(
                "owner key does not match the voucher's last entry",
            ));
        }
        let num_ov_entries = voucher.num_entries()?;

        let kex_params = generate_local(kex_suite)?;
        let nonce_to2_prove_dv = Nonce::random();
        let payload = ProveOvHdrPayload {
            ov_header: voucher.header.clone(),
            num_ov_entries,
            hmac: voucher.header_hmac.clone(),
            nonce_to2_prove_ov: hello.nonce_to2_prove_ov,
            eb_sig_info: SigInfo::new(device_sig_type),
            xa_key_exchange: kex_params.exchange.clone(),
            hello_device_hash: digest(HashType::Sha256, body)?,
            max_owner_message_size: self.config.max_owner_message_size,
        };
        let unprotected = UnprotectedHeader {
            cuph_nonce: Some(nonce_to2_prove_dv),
            cuph_owner_pub_key: Some(self.owner_public_key.clone()),
            ..UnprotectedHeader::default()
        };
        let signed = self.owner_key.sign(
            &codec::to_vec(&payload)?,
            ProtectedHeader::default(),
            unprotected,
        )?;

        let session = ProtocolSession {
            revision: 0,
            stage: To2Stage::HelloDevice,
            guid: hello.guid,
            nonce_to2_prove_ov: hello.nonce_to2_prove_ov,
            nonce_to2_prove_dv,
            nonce_to2_setup_dv: None,
            kex_suite,
            cipher_suite,
            device_sig_type,
            kex_params,
            session_key: None,
            num_ov_entries,
            last_ov_entry: None,
            replacement_hmac: None,
            max_owner_service_info_sz: negotiated_size(None),
            max_device_service_info_sz: self.config.max_device_service_info_size,
            device_service_info: Vec::new(),
            owner_service_info_sent: 0,
            owner_service_info_done: false,
            failed: false,
        };
        let id = self.sessions.create(&session).await?;
        info!(
            session = %id,
            guid = %hello.guid,
            %kex_suite,
            %cipher_suite,
            num_ov_entries,
            "TO2 session opened"
        );

        Ok(To2Response::ok(MessageType::ProveOvHdr, codec::to_vec(&signed)?).with_bearer(&id))
    }

    async fn get_ov_next_entry(
        &self,
        next: &mut ProtocolSession,
        body: &[u8],
    ) -> Result<Reply, Rejection> {
        let request: GetOvNextEntry = messages::decode("GetOVNextEntry", body)?;
        let index = request.ov_entry_num;
        let expected = next.last_ov_entry.map_or(0, |last| last.saturating_add(1));

        if index < expected {
            return Err(Rejection::Stale(FdoError::sequence(format!(
                "voucher entry {index} was already delivered"
            ))));
        }
        if index != expected || index >= next.num_ov_entries {
            return Err(FdoError::sequence(format!(
                "voucher entry {index} requested, expected {expected} of {}",
                next.num_ov_entries
            ))
            .into());
        }

        let voucher = self.voucher(&next.guid).await?;
        let ov_entry = voucher.entry(index)?.clone();
        next.stage = To2Stage::GetOvNextEntry;
        next.last_ov_entry = Some(index);

        Ok(Reply::new(
            MessageType::OvNextEntry,
            &OvNextEntry {
                ov_entry_num: index,
                ov_entry,
            },
        )?)
    }

    async fn prove_device(
        &self,
        next: &mut ProtocolSession,
        body: &[u8],
    ) -> Result<Reply, Rejection> {
        let signed: CoseSignature = messages::decode("ProveDevice", body)?;

        let voucher = self.voucher(&next.guid).await?;
        let chain = voucher.verified_cert_chain()?;
        cose::verify_with_chain(&signed, next.device_sig_type.public_key_type()?, chain)?;

        let eat: EatPayload = signed.decode_payload()?;
        if !eat.nonce.ct_eq(&next.nonce_to2_prove_dv) {
            return Err(FdoError::sequence("EAT nonce does not match NonceTO2ProveDv").into());
        }
        if eat.guid != next.guid {
            return Err(FdoError::verification("EAT names a different device").into());
        }
        let nonce_to2_setup_dv = signed
            .unprotected()
            .euph_nonce
            .ok_or_else(|| FdoError::malformed("ProveDevice carries no EUPHNonce"))?;

        let session_key = derive_shared(
            &next.kex_params,
            next.kex_suite,
            &eat.xb_key_exchange,
            KexSide::Owner,
        )?;
        debug!(guid = %next.guid, "device proved possession; tunnel keyed");

        let setup = SetupDevicePayload {
            rendezvous_info: voucher.header()?.rv_info,
            guid: next.guid,
            nonce_to2_setup_dv,
            owner2_key: self.owner_public_key.clone(),
        };
        let signed_setup = self.owner_key.sign(
            &codec::to_vec(&setup)?,
            ProtectedHeader::default(),
            UnprotectedHeader::default(),
        )?;

        next.stage = To2Stage::ProveDevice;
        next.session_key = Some(session_key);
        next.nonce_to2_setup_dv = Some(nonce_to2_setup_dv);
        Ok(Reply::new(MessageType::SetupDevice, &signed_setup)?)
    }

    fn device_service_info(
        &self,
        next: &mut ProtocolSession,
        body: &[u8],
    ) -> Result<Reply, Rejection> {
        if body.len() > usize::from(next.max_device_service_info_sz) {
            return Err(FdoError::malformed(format!(
                "DeviceServiceInfo of {} bytes exceeds the negotiated {}",
                body.len(),
                next.max_device_service_info_sz
            ))
            .into());
        }
        let message: DeviceServiceInfo = messages::decode("DeviceServiceInfo", body)?;
        next.device_service_info.extend(message.service_info);
        next.stage = To2Stage::DeviceServiceInfo;

        let reply = if message.is_more_service_info {
            OwnerServiceInfo {
                is_more_service_info: false,
                is_done: false,
                service_info: Vec::new(),
            }
        } else {
            let pending = self
                .service_info
                .get(next.owner_service_info_sent..)
                .unwrap_or_default();
            let budget =
                usize::from(next.max_owner_service_info_sz).saturating_sub(MESSAGE_OVERHEAD);
            let (chunk, consumed) = next_chunk(pending, budget)?;
            next.owner_service_info_sent += consumed;
            let is_done = next.owner_service_info_sent >= self.service_info.len();
            next.owner_service_info_done = is_done;
            OwnerServiceInfo {
                is_more_service_info: !is_done,
                is_done,
                service_info: chunk,
            }
        };
        Ok(Reply::new(MessageType::OwnerServiceInfo, &reply)?)
    }
}

fn session_cipher(session: &ProtocolSession) -> FdoResult<SessionCipher> {
    let key = session
        .session_key
        .as_ref()
        .ok_or_else(|| FdoError::internal("session has no key yet"))?;
    SessionCipher::new(session.cipher_suite, key)
}

fn device_service_info_ready(next: &mut ProtocolSession, body: &[u8]) -> FdoResult<Reply> {
    let ready: DeviceServiceInfoReady = messages::decode("DeviceServiceInfoReady", body)?;
    next.replacement_hmac = ready.replacement_hmac;
    next.max_owner_service_info_sz = negotiated_size(ready.max_owner_service_info_sz);
    next.stage = To2Stage::DeviceServiceInfoReady;

    Reply::new(
        MessageType::OwnerServiceInfoReady,
        &OwnerServiceInfoReady {
            max_device_service_info_sz: Some(next.max_device_service_info_sz),
        },
    )
}

fn done(next: &mut ProtocolSession, body: &[u8]) -> FdoResult<Reply> {
    let done: Done = messages::decode("Done", body)?;
    if !done.nonce_to2_prove_dv.ct_eq(&next.nonce_to2_prove_dv) {
        return Err(FdoError::sequence("Done nonce does not match NonceTO2ProveDv"));
    }
    let nonce_to2_setup_dv = next
        .nonce_to2_setup_dv
        .ok_or_else(|| FdoError::internal("session reached Done without NonceTO2SetupDv"))?;

    next.stage = To2Stage::Done;
    info!(
        guid = %next.guid,
        device_service_info = next.device_service_info.len(),
        "TO2 complete"
    );
    Reply::new(MessageType::Done2, &Done2 { nonce_to2_setup_dv })
}
