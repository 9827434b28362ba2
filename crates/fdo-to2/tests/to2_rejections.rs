//! Owner rejections: authorization, sequencing, nonce continuity and tampering

use std::time::Duration;

use fdo_core::{codec, CipherSuite, ErrorCode, Guid, KexSuite, MessageType, Nonce};
use fdo_crypto::cose::{ProtectedHeader, UnprotectedHeader};
use fdo_crypto::{generate_local, SigType, SigningKey};
use fdo_testkit::{init_tracing, test_key, OwnerHarness, VoucherFixture};
use fdo_to2::messages::{Done, EatPayload, GetOvNextEntry};
use fdo_to2::{
    MemorySessionStore, MemoryVoucherStore, OwnerConfig, ProtocolSession, SessionId,
    SessionStore, To2Device, To2Owner, To2Request, To2Response,
};

fn code(response: &To2Response) -> ErrorCode {
    assert!(response.is_error(), "expected an error, got {}", response.message_type);
    response.error_message().unwrap().code
}

async fn stored_session(harness: &OwnerHarness, device: &To2Device) -> ProtocolSession {
    let id: SessionId = device.token().unwrap().parse().unwrap();
    harness.sessions.get(&id).await.unwrap()
}

async fn session_failed(harness: &OwnerHarness, device: &To2Device) -> bool {
    stored_session(harness, device).await.failed
}

/// Run a device through every voucher entry, up to ProveDevice
async fn drive_to_prove_device(harness: &OwnerHarness, device: &mut To2Device) {
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    while let Some(index) = device.next_entry() {
        let response = harness.send(device.get_ov_next_entry(index).unwrap()).await;
        device.process_ov_next_entry(&response).unwrap();
    }
}

/// ProveDevice carrying `eat`, signed by `key`
fn prove_device_with(device: &To2Device, key: &SigningKey, eat: &EatPayload) -> To2Request {
    let signed = key
        .sign(
            &codec::to_vec(eat).unwrap(),
            ProtectedHeader::default(),
            UnprotectedHeader {
                euph_nonce: Some(Nonce::random()),
                ..UnprotectedHeader::default()
            },
        )
        .unwrap();
    device
        .request(MessageType::ProveDevice, codec::to_vec(&signed).unwrap())
        .unwrap()
}

async fn assert_prove_device_rejected(harness: &OwnerHarness, device: &To2Device, request: To2Request) {
    let response = harness.send(request).await;
    assert_eq!(response.status, 400);
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    let session = stored_session(harness, device).await;
    assert!(session.failed);
    assert!(session.session_key.is_none());
}

/// Run a device up to the point where it would send Done
async fn drive_to_done(harness: &OwnerHarness, device: &mut To2Device) {
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    while let Some(index) = device.next_entry() {
        let response = harness.send(device.get_ov_next_entry(index).unwrap()).await;
        device.process_ov_next_entry(&response).unwrap();
    }
    let response = harness.send(device.prove_device().unwrap()).await;
    device.process_setup_device(&response).unwrap();
    let response = harness.send(device.device_service_info_ready(None).unwrap()).await;
    device.process_owner_service_info_ready(&response).unwrap();
    let response = harness.send(device.device_service_info().unwrap()).await;
    assert!(device.process_owner_service_info(&response).unwrap());
}

#[tokio::test]
async fn test_missing_and_unknown_tokens_are_unauthorized() {
    init_tracing();
    let harness = OwnerHarness::new().await;
    let body = codec::to_vec(&GetOvNextEntry { ov_entry_num: 0 }).unwrap();

    let response = harness
        .send(To2Request::new(MessageType::GetOvNextEntry, body.clone()))
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(code(&response), ErrorCode::InvalidJwtToken);

    let response = harness
        .send(To2Request::new(MessageType::GetOvNextEntry, body.clone()).with_bearer("garbage"))
        .await;
    assert_eq!(code(&response), ErrorCode::InvalidJwtToken);

    let response = harness
        .send(
            To2Request::new(MessageType::GetOvNextEntry, body)
                .with_bearer(SessionId::new().to_string()),
        )
        .await;
    assert_eq!(response.status, 401);
}

#[tokio::test]
async fn test_token_is_checked_before_the_envelope() {
    let config = OwnerConfig {
        max_owner_message_size: 64,
        ..OwnerConfig::default()
    };
    let harness = OwnerHarness::with(config, VoucherFixture::builder().build()).await;
    let body = codec::to_vec(&GetOvNextEntry { ov_entry_num: 0 }).unwrap();

    let mut request = To2Request::new(MessageType::GetOvNextEntry, body);
    request.content_type = Some("application/json".to_string());
    let response = harness.send(request).await;
    assert_eq!(response.status, 401);
    assert_eq!(code(&response), ErrorCode::InvalidJwtToken);

    let response = harness
        .send(To2Request::new(MessageType::GetOvNextEntry, vec![0; 200]))
        .await;
    assert_eq!(response.status, 401);

    let mut request = To2Request::new(MessageType::HelloDevice, vec![]);
    request.message_type = 59;
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::InvalidJwtToken);

    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    let mut request = device.get_ov_next_entry(0).unwrap();
    request.content_type = Some("application/json".to_string());
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::MessageBodyError);
}

#[tokio::test]
async fn test_expired_session_is_unauthorized() {
    let fixture = VoucherFixture::builder().build();
    let vouchers = MemoryVoucherStore::new();
    vouchers.insert(&fixture.voucher).await.unwrap();
    let owner = To2Owner::new(
        OwnerConfig::default(),
        fixture.owner_key().clone(),
        MemorySessionStore::with_ttl(Duration::from_millis(50)),
        vouchers,
    )
    .unwrap();

    let mut device = To2Device::new(fixture.credential(), KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = owner.handle(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();

    std::thread::sleep(Duration::from_millis(80));
    let response = owner.handle(device.get_ov_next_entry(0).unwrap()).await;
    assert_eq!(response.status, 401);
    assert_eq!(code(&response), ErrorCode::InvalidJwtToken);
}

#[tokio::test]
async fn test_done_with_flipped_nonce_fails_session() {
    init_tracing();
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    drive_to_done(&harness, &mut device).await;

    let mut nonce = *device.nonce_to2_prove_dv().unwrap().as_bytes();
    nonce[15] ^= 0x01;
    let forged = Done {
        nonce_to2_prove_dv: Nonce::from_slice(&nonce).unwrap(),
    };
    let request = device
        .request(MessageType::Done, codec::to_vec(&forged).unwrap())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status, 400);
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    assert!(session_failed(&harness, &device).await);

    let response = harness.send(device.done().unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
}

#[tokio::test]
async fn test_skipped_entry_fails_session() {
    let harness = OwnerHarness::with(
        OwnerConfig::default(),
        VoucherFixture::builder().entries(3).build(),
    )
    .await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();

    let response = harness.send(device.get_ov_next_entry(1).unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    assert!(session_failed(&harness, &device).await);

    let response = harness.send(device.get_ov_next_entry(0).unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
}

#[tokio::test]
async fn test_entry_order_after_first_entry() {
    let harness = OwnerHarness::with(
        OwnerConfig::default(),
        VoucherFixture::builder().entries(3).build(),
    )
    .await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    let response = harness.send(device.get_ov_next_entry(0).unwrap()).await;
    device.process_ov_next_entry(&response).unwrap();
    let before = stored_session(&harness, &device).await;
    assert_eq!(before.last_ov_entry, Some(0));

    let response = harness.send(device.get_ov_next_entry(0).unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    let after = stored_session(&harness, &device).await;
    assert!(!after.failed);
    assert_eq!(after.last_ov_entry, Some(0));
    assert_eq!(after.revision, before.revision);

    let response = harness.send(device.get_ov_next_entry(2).unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    let session = stored_session(&harness, &device).await;
    assert!(session.failed);
    assert_eq!(session.last_ov_entry, Some(0));
}

#[tokio::test]
async fn test_entry_beyond_voucher_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    let response = harness.send(device.get_ov_next_entry(0).unwrap()).await;
    device.process_ov_next_entry(&response).unwrap();

    let response = harness.send(device.get_ov_next_entry(1).unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    assert!(session_failed(&harness, &device).await);
}

#[tokio::test]
async fn test_prove_device_before_entries_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();

    let token = device.token().unwrap().to_string();
    let request = To2Request::new(MessageType::ProveDevice, vec![0x80]).with_bearer(&token);
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    assert!(session_failed(&harness, &device).await);
}

#[tokio::test]
async fn test_attestation_with_wrong_nonce_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    drive_to_prove_device(&harness, &mut device).await;

    let mut nonce = *device.nonce_to2_prove_dv().unwrap().as_bytes();
    nonce[0] ^= 0x01;
    let eat = EatPayload {
        nonce: Nonce::from_slice(&nonce).unwrap(),
        guid: harness.fixture.guid,
        xb_key_exchange: generate_local(KexSuite::Ecdh256).unwrap().exchange.to_vec(),
    };
    let request = prove_device_with(&device, &harness.fixture.attestation_key, &eat);
    assert_prove_device_rejected(&harness, &device, request).await;
}

#[tokio::test]
async fn test_attestation_for_other_guid_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    drive_to_prove_device(&harness, &mut device).await;

    let eat = EatPayload {
        nonce: device.nonce_to2_prove_dv().unwrap(),
        guid: Guid::random(),
        xb_key_exchange: generate_local(KexSuite::Ecdh256).unwrap().exchange.to_vec(),
    };
    let request = prove_device_with(&device, &harness.fixture.attestation_key, &eat);
    assert_prove_device_rejected(&harness, &device, request).await;
}

#[tokio::test]
async fn test_attestation_outside_device_chain_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    drive_to_prove_device(&harness, &mut device).await;

    let eat = EatPayload {
        nonce: device.nonce_to2_prove_dv().unwrap(),
        guid: harness.fixture.guid,
        xb_key_exchange: generate_local(KexSuite::Ecdh256).unwrap().exchange.to_vec(),
    };
    let impostor = test_key(SigType::StSecp256r1);
    let request = prove_device_with(&device, &impostor, &eat);
    assert_prove_device_rejected(&harness, &device, request).await;
}

#[tokio::test]
async fn test_done_right_after_hello_is_out_of_sequence() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();

    let request =
        To2Request::new(MessageType::Done, vec![]).with_bearer(device.token().unwrap());
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
}

#[tokio::test]
async fn test_owner_messages_and_unknown_types_rejected() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    let token = device.token().unwrap().to_string();

    let response = harness
        .send(To2Request::new(MessageType::ProveOvHdr, vec![]).with_bearer(&token))
        .await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);

    let mut request = To2Request::new(MessageType::HelloDevice, vec![]).with_bearer(&token);
    request.message_type = 59;
    let response = harness.send(request).await;
    assert_eq!(response.status, 400);
    assert_eq!(code(&response), ErrorCode::MessageBodyError);
    assert_eq!(response.error_message().unwrap().prev_msg_id, 59);
}

#[tokio::test]
async fn test_malformed_hello_and_wrong_content_type() {
    let harness = OwnerHarness::new().await;

    let response = harness
        .send(To2Request::new(MessageType::HelloDevice, vec![0x01, 0x02]))
        .await;
    assert_eq!(code(&response), ErrorCode::MessageBodyError);

    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let mut request = device.hello_device().unwrap();
    request.content_type = Some("application/json".to_string());
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::MessageBodyError);
}

#[tokio::test]
async fn test_unsupported_and_unoffered_suites() {
    let config = OwnerConfig {
        supported_kex_suites: vec![KexSuite::Ecdh256],
        supported_cipher_suites: vec![CipherSuite::A128Gcm],
        ..OwnerConfig::default()
    };
    let harness = OwnerHarness::with(config, VoucherFixture::builder().build()).await;

    for (kex_suite, cipher_suite) in [
        (KexSuite::AsymKex2048, CipherSuite::A128Gcm),
        (KexSuite::Ecdh384, CipherSuite::A128Gcm),
        (KexSuite::Ecdh256, CipherSuite::A256Gcm),
    ] {
        let mut device = harness.device(kex_suite, cipher_suite);
        let response = harness.send(device.hello_device().unwrap()).await;
        assert_eq!(code(&response), ErrorCode::InvalidMessageError);
        assert!(device.process_prove_ov_hdr(&response).is_err());
    }
}

#[tokio::test]
async fn test_unknown_device_is_malformed() {
    let harness = OwnerHarness::new().await;
    let stranger = VoucherFixture::builder().build();
    let mut device = To2Device::new(stranger.credential(), KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    assert_eq!(code(&response), ErrorCode::MessageBodyError);
}

#[tokio::test]
async fn test_owner_key_must_match_voucher() {
    let fixture = VoucherFixture::builder().build();
    let vouchers = MemoryVoucherStore::new();
    vouchers.insert(&fixture.voucher).await.unwrap();
    let owner = To2Owner::new(
        OwnerConfig::default(),
        test_key(SigType::StSecp256r1),
        MemorySessionStore::new(),
        vouchers,
    )
    .unwrap();

    let mut device = To2Device::new(fixture.credential(), KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = owner.handle(device.hello_device().unwrap()).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
}

#[tokio::test]
async fn test_tampered_tunnel_message_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    let response = harness.send(device.get_ov_next_entry(0).unwrap()).await;
    device.process_ov_next_entry(&response).unwrap();
    let response = harness.send(device.prove_device().unwrap()).await;
    device.process_setup_device(&response).unwrap();

    let mut request = device.device_service_info_ready(None).unwrap();
    let last = request.body.len() - 1;
    request.body[last] ^= 0x80;
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::InvalidMessageError);
    assert!(session_failed(&harness, &device).await);
}

#[tokio::test]
async fn test_device_rejects_foreign_owner_reply() {
    let harness = OwnerHarness::new().await;
    let other = OwnerHarness::new().await;

    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    device.hello_device().unwrap();
    let mut stranger = other.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = other.send(stranger.hello_device().unwrap()).await;
    assert!(device.process_prove_ov_hdr(&response).is_err());
}

#[tokio::test]
async fn test_oversized_device_service_info_fails_session() {
    let harness = OwnerHarness::new().await;
    let mut device = harness.device(KexSuite::Ecdh256, CipherSuite::A128Gcm);
    let response = harness.send(device.hello_device().unwrap()).await;
    device.process_prove_ov_hdr(&response).unwrap();
    let response = harness.send(device.get_ov_next_entry(0).unwrap()).await;
    device.process_ov_next_entry(&response).unwrap();
    let response = harness.send(device.prove_device().unwrap()).await;
    device.process_setup_device(&response).unwrap();
    let response = harness.send(device.device_service_info_ready(None).unwrap()).await;
    device.process_owner_service_info_ready(&response).unwrap();

    let oversized = fdo_to2::messages::DeviceServiceInfo {
        is_more_service_info: false,
        service_info: vec![fdo_to2::ServiceInfoKv::new("devmod:big", vec![0; 1400])],
    };
    let request = device
        .request(MessageType::DeviceServiceInfo, codec::to_vec(&oversized).unwrap())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(code(&response), ErrorCode::MessageBodyError);
    assert!(session_failed(&harness, &device).await);
}
