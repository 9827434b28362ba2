//! Owner-side TO2 session state

use fdo_core::{CipherSuite, Guid, KexSuite, MessageType, Nonce};
use fdo_crypto::{KexParams, SessionKey, SigType};
use serde::{Deserialize, Serialize};

use crate::service_info::ServiceInfo;

/// Last device message the owner accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum To2Stage {
    /// HelloDevice answered with ProveOVHdr
    HelloDevice,
    /// At least one GetOVNextEntry answered
    GetOvNextEntry,
    /// ProveDevice answered with SetupDevice; the tunnel is up
    ProveDevice,
    /// DeviceServiceInfoReady answered
    DeviceServiceInfoReady,
    /// At least one DeviceServiceInfo answered
    DeviceServiceInfo,
    /// Done answered with Done2
    Done,
}

/// State the owner keeps between TO2 messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSession {
    /// Incremented on every persisted change; the store rejects stale writes
    pub revision: u64,
    /// Progress through the protocol
    pub stage: To2Stage,
    /// Device GUID from HelloDevice
    pub guid: Guid,
    /// NonceTO2ProveOV from HelloDevice
    pub nonce_to2_prove_ov: Nonce,
    /// NonceTO2ProveDv issued in ProveOVHdr
    pub nonce_to2_prove_dv: Nonce,
    /// NonceTO2SetupDv from ProveDevice
    pub nonce_to2_setup_dv: Option<Nonce>,
    /// Negotiated key exchange suite
    pub kex_suite: KexSuite,
    /// Negotiated cipher suite
    pub cipher_suite: CipherSuite,
    /// Signature type the device attests with
    pub device_sig_type: SigType,
    /// Owner key exchange parameters
    pub kex_params: KexParams,
    /// Shared secret once ProveDevice is accepted
    pub session_key: Option<SessionKey>,
    /// Voucher entries in the chain
    pub num_ov_entries: u8,
    /// Highest entry index already delivered
    pub last_ov_entry: Option<u8>,
    /// Replacement voucher HMAC from DeviceServiceInfoReady
    pub replacement_hmac: Option<fdo_core::Hash>,
    /// Largest owner service info message the device accepts
    pub max_owner_service_info_sz: u16,
    /// Largest device service info message the owner accepts
    pub max_device_service_info_sz: u16,
    /// Service info received from the device so far
    pub device_service_info: ServiceInfo,
    /// Owner service info entries already sent
    pub owner_service_info_sent: usize,
    /// Owner has sent its final service info
    pub owner_service_info_done: bool,
    /// A fatal error was reported; the session accepts nothing further
    pub failed: bool,
}

impl ProtocolSession {
    /// Whether `message` may be processed in the current stage
    ///
    /// GetOVNextEntry stays admissible after the last entry so that a repeated
    /// request can be answered as a replay instead of a sequence failure.
    pub fn accepts(&self, message: MessageType) -> bool {
        if self.failed {
            return false;
        }
        let all_entries_sent = self
            .last_ov_entry
            .map(|last| last.saturating_add(1) >= self.num_ov_entries)
            .unwrap_or(self.num_ov_entries == 0);

        match (self.stage, message) {
            (To2Stage::HelloDevice | To2Stage::GetOvNextEntry, MessageType::GetOvNextEntry) => true,
            (To2Stage::HelloDevice | To2Stage::GetOvNextEntry, MessageType::ProveDevice) => {
                all_entries_sent
            }
            (To2Stage::ProveDevice, MessageType::DeviceServiceInfoReady) => true,
            (To2Stage::DeviceServiceInfoReady, MessageType::DeviceServiceInfo) => true,
            (To2Stage::DeviceServiceInfo, MessageType::DeviceServiceInfo) => {
                !self.owner_service_info_done
            }
            (To2Stage::DeviceServiceInfo, MessageType::Done) => self.owner_service_info_done,
            _ => false,
        }
    }

    /// Whether the session completed with Done2
    pub fn is_complete(&self) -> bool {
        self.stage == To2Stage::Done
    }

    /// Whether inbound messages arrive inside the encrypted tunnel
    pub fn tunnel_established(&self) -> bool {
        self.session_key.is_some()
    }

    /// Copy of this session with the revision advanced
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next
    }
}
