//! TO2 message bodies
//!
//! Each struct encodes as the positional CBOR array defined for its message type.
//! Signed messages (61, 63, 64, 65) are `COSE_Sign1` structures whose payloads are
//! the `*Payload` types below.

use std::collections::BTreeMap;

use fdo_core::{cbor_array, codec, FdoError, FdoResult, Guid, Hash, Nonce};
use fdo_crypto::{CoseSignature, SigType};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use serde_cbor::Value;

use crate::service_info::ServiceInfo;
use crate::voucher::{OvHeader, RendezvousInfo};
use fdo_crypto::FdoPublicKey;

cbor_array! {
    /// Signature scheme advertisement: `[sgType, info]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SigInfo {
        /// Device signature type
        pub sig_type: SigType,
        /// Scheme-specific data, empty outside EPID
        pub info: ByteBuf,
    }
}

impl SigInfo {
    /// Advertisement for a non-EPID signature type
    pub fn new(sig_type: SigType) -> Self {
        Self {
            sig_type,
            info: ByteBuf::new(),
        }
    }
}

cbor_array! {
    /// TO2.HelloDevice (60)
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HelloDevice {
        /// Largest message the device accepts, 0 for the protocol default
        pub max_device_message_size: u16,
        /// Device identifier
        pub guid: Guid,
        /// NonceTO2ProveOV, echoed in ProveOVHdr
        pub nonce_to2_prove_ov: Nonce,
        /// Requested key exchange suite name
        pub kex_suite_name: String,
        /// Requested cipher suite identifier
        pub cipher_suite_name: i64,
        /// Device attestation signature scheme
        pub ea_sig_info: SigInfo,
    }
}

cbor_array! {
    /// Payload of TO2.ProveOVHdr (61)
    #[derive(Debug, Clone, PartialEq)]
    pub struct ProveOvHdrPayload {
        /// Voucher header exactly as stored, so the HMAC still applies
        pub ov_header: ByteBuf,
        /// Number of voucher entries the device must fetch
        pub num_ov_entries: u8,
        /// Voucher header HMAC
        pub hmac: Hash,
        /// Echo of NonceTO2ProveOV
        pub nonce_to2_prove_ov: Nonce,
        /// Signature scheme the owner expects from the device
        pub eb_sig_info: SigInfo,
        /// Owner key exchange blob
        pub xa_key_exchange: ByteBuf,
        /// SHA-256 over the HelloDevice body
        pub hello_device_hash: Hash,
        /// Largest message the owner accepts, 0 for the protocol default
        pub max_owner_message_size: u16,
    }
}

impl ProveOvHdrPayload {
    /// Decode the embedded voucher header
    pub fn header(&self) -> FdoResult<OvHeader> {
        codec::from_slice(&self.ov_header)
    }
}

cbor_array! {
    /// TO2.GetOVNextEntry (62)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GetOvNextEntry {
        /// Zero-based entry index
        pub ov_entry_num: u8,
    }
}

cbor_array! {
    /// TO2.OVNextEntry (63)
    #[derive(Debug, Clone, PartialEq)]
    pub struct OvNextEntry {
        /// Index of the returned entry
        pub ov_entry_num: u8,
        /// Signed voucher entry
        pub ov_entry: CoseSignature,
    }
}

/// EAT claim keys used in TO2.ProveDevice
pub mod claim {
    /// Nonce claim
    pub const NONCE: i64 = 10;
    /// Universal entity id claim
    pub const UEID: i64 = 256;
    /// FDO claim carrying `[xBKeyExchange]`
    pub const FDO: i64 = -257;
}

/// UEID type byte for a random identifier
pub const UEID_TYPE_RAND: u8 = 1;

/// Payload of TO2.ProveDevice (64), an Entity Attestation Token
#[derive(Debug, Clone, PartialEq)]
pub struct EatPayload {
    /// NonceTO2ProveDv from ProveOVHdr
    pub nonce: Nonce,
    /// Device GUID
    pub guid: Guid,
    /// Device key exchange blob
    pub xb_key_exchange: Vec<u8>,
}

impl EatPayload {
    fn ueid(&self) -> Vec<u8> {
        let mut ueid = Vec::with_capacity(1 + Guid::LEN);
        ueid.push(UEID_TYPE_RAND);
        ueid.extend_from_slice(self.guid.as_bytes());
        ueid
    }
}

impl Serialize for EatPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry(&claim::NONCE, &self.nonce)?;
        map.serialize_entry(&claim::UEID, serde_bytes::Bytes::new(&self.ueid()))?;
        map.serialize_entry(&claim::FDO, &(serde_bytes::Bytes::new(&self.xb_key_exchange),))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for EatPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut claims = BTreeMap::<Value, Value>::deserialize(deserializer)?;
        let mut take = |key: i64| {
            claims
                .remove(&Value::Integer(key.into()))
                .ok_or_else(|| D::Error::custom(format!("EAT claim {key} missing")))
        };

        let nonce = match take(claim::NONCE)? {
            Value::Bytes(bytes) => Nonce::from_slice(&bytes).map_err(D::Error::custom)?,
            _ => return Err(D::Error::custom("EAT nonce must be a byte string")),
        };
        let guid = match take(claim::UEID)? {
            Value::Bytes(bytes) if bytes.len() == 1 + Guid::LEN && bytes[0] == UEID_TYPE_RAND => {
                Guid::from_slice(&bytes[1..]).map_err(D::Error::custom)?
            }
            _ => return Err(D::Error::custom("EAT UEID must be 0x01 followed by the GUID")),
        };
        let xb_key_exchange = match take(claim::FDO)? {
            Value::Array(mut items) if items.len() == 1 => match items.remove(0) {
                Value::Bytes(bytes) => bytes,
                _ => return Err(D::Error::custom("xBKeyExchange must be a byte string")),
            },
            _ => return Err(D::Error::custom("EAT FDO claim must be [xBKeyExchange]")),
        };

        Ok(Self {
            nonce,
            guid,
            xb_key_exchange,
        })
    }
}

cbor_array! {
    /// Payload of TO2.SetupDevice (65)
    #[derive(Debug, Clone, PartialEq)]
    pub struct SetupDevicePayload {
        /// Rendezvous instructions for the next owner
        pub rendezvous_info: RendezvousInfo,
        /// GUID the device should adopt
        pub guid: Guid,
        /// Echo of NonceTO2SetupDv
        pub nonce_to2_setup_dv: Nonce,
        /// Key of the owner that will hold the replacement voucher
        pub owner2_key: FdoPublicKey,
    }
}

cbor_array! {
    /// TO2.DeviceServiceInfoReady (66)
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DeviceServiceInfoReady {
        /// HMAC over the replacement voucher header, absent on credential reuse
        pub replacement_hmac: Option<Hash>,
        /// Largest owner service info the device accepts
        pub max_owner_service_info_sz: Option<u16>,
    }
}

cbor_array! {
    /// TO2.OwnerServiceInfoReady (67)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OwnerServiceInfoReady {
        /// Largest device service info the owner accepts
        pub max_device_service_info_sz: Option<u16>,
    }
}

cbor_array! {
    /// TO2.DeviceServiceInfo (68)
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DeviceServiceInfo {
        /// Device has more service info queued
        pub is_more_service_info: bool,
        /// Key/value entries
        pub service_info: ServiceInfo,
    }
}

cbor_array! {
    /// TO2.OwnerServiceInfo (69)
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OwnerServiceInfo {
        /// Owner has more service info for this round
        pub is_more_service_info: bool,
        /// Owner has nothing further to send
        pub is_done: bool,
        /// Key/value entries
        pub service_info: ServiceInfo,
    }
}

cbor_array! {
    /// TO2.Done (70)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Done {
        /// Echo of NonceTO2ProveDv
        pub nonce_to2_prove_dv: Nonce,
    }
}

cbor_array! {
    /// TO2.Done2 (71)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Done2 {
        /// Echo of NonceTO2SetupDv
        pub nonce_to2_setup_dv: Nonce,
    }
}

/// Decode a message body, naming the message in the error
pub fn decode<T: serde::de::DeserializeOwned>(name: &str, body: &[u8]) -> FdoResult<T> {
    codec::from_slice(body).map_err(|e| FdoError::malformed(format!("{name}: {}", e.message())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_device_layout() {
        let hello = HelloDevice {
            max_device_message_size: 0,
            guid: Guid::from_bytes([1; 16]),
            nonce_to2_prove_ov: Nonce::from_bytes([2; 16]),
            kex_suite_name: "ECDH256".into(),
            cipher_suite_name: 1,
            ea_sig_info: SigInfo::new(SigType::StSecp256r1),
        };
        let bytes = codec::to_vec(&hello).unwrap();
        assert_eq!(bytes[0], 0x86);
        assert_eq!(decode::<HelloDevice>("HelloDevice", &bytes).unwrap(), hello);
    }

    #[test]
    fn test_eat_claims() {
        let eat = EatPayload {
            nonce: Nonce::from_bytes([3; 16]),
            guid: Guid::from_bytes([4; 16]),
            xb_key_exchange: vec![9; 86],
        };
        let bytes = codec::to_vec(&eat).unwrap();
        let Value::Map(map) = codec::from_slice::<Value>(&bytes).unwrap() else {
            panic!("EAT is not a map");
        };
        assert!(map.contains_key(&Value::Integer(10)));
        assert!(map.contains_key(&Value::Integer(256)));
        assert!(map.contains_key(&Value::Integer(-257)));
        assert_eq!(codec::from_slice::<EatPayload>(&bytes).unwrap(), eat);
    }

    #[test]
    fn test_eat_missing_nonce_rejected() {
        let mut map = BTreeMap::new();
        map.insert(Value::Integer(256), Value::Bytes(vec![1; 17]));
        let bytes = codec::to_vec(&Value::Map(map)).unwrap();
        assert!(codec::from_slice::<EatPayload>(&bytes).is_err());
    }

    #[test]
    fn test_service_info_ready_nulls() {
        let ready = DeviceServiceInfoReady {
            replacement_hmac: None,
            max_owner_service_info_sz: None,
        };
        let bytes = codec::to_vec(&ready).unwrap();
        assert_eq!(bytes, vec![0x82, 0xf6, 0xf6]);
    }

    #[test]
    fn test_wrong_arity_is_malformed() {
        let bytes = codec::to_vec(&(1u8, 2u8)).unwrap();
        assert!(matches!(
            decode::<GetOvNextEntry>("GetOVNextEntry", &bytes),
            Err(FdoError::MalformedInput { .. })
        ));
    }
}
