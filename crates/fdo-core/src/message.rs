//! TO2 message identifiers and the protocol error message

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cbor_array;
use crate::errors::{FdoError, FdoResult};

/// Message type numbers used by the TO2 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    /// 60, device → owner
    HelloDevice,
    /// 61, owner → device
    ProveOvHdr,
    /// 62, device → owner
    GetOvNextEntry,
    /// 63, owner → device
    OvNextEntry,
    /// 64, device → owner
    ProveDevice,
    /// 65, owner → device
    SetupDevice,
    /// 66, device → owner
    DeviceServiceInfoReady,
    /// 67, owner → device
    OwnerServiceInfoReady,
    /// 68, device → owner
    DeviceServiceInfo,
    /// 69, owner → device
    OwnerServiceInfo,
    /// 70, device → owner
    Done,
    /// 71, owner → device
    Done2,
    /// 255, either direction
    Error,
}

impl MessageType {
    /// Numeric identifier on the wire
    pub fn id(self) -> u8 {
        match self {
            Self::HelloDevice => 60,
            Self::ProveOvHdr => 61,
            Self::GetOvNextEntry => 62,
            Self::OvNextEntry => 63,
            Self::ProveDevice => 64,
            Self::SetupDevice => 65,
            Self::DeviceServiceInfoReady => 66,
            Self::OwnerServiceInfoReady => 67,
            Self::DeviceServiceInfo => 68,
            Self::OwnerServiceInfo => 69,
            Self::Done => 70,
            Self::Done2 => 71,
            Self::Error => 255,
        }
    }

    /// Messages from SetupDevice onward travel inside the encrypted tunnel
    pub fn is_encrypted(self) -> bool {
        (65..=71).contains(&self.id())
    }

    /// Whether the device sends this message
    pub fn is_device_request(self) -> bool {
        matches!(
            self,
            Self::HelloDevice
                | Self::GetOvNextEntry
                | Self::ProveDevice
                | Self::DeviceServiceInfoReady
                | Self::DeviceServiceInfo
                | Self::Done
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.id())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FdoError;

    fn try_from(value: u8) -> FdoResult<Self> {
        Ok(match value {
            60 => Self::HelloDevice,
            61 => Self::ProveOvHdr,
            62 => Self::GetOvNextEntry,
            63 => Self::OvNextEntry,
            64 => Self::ProveDevice,
            65 => Self::SetupDevice,
            66 => Self::DeviceServiceInfoReady,
            67 => Self::OwnerServiceInfoReady,
            68 => Self::DeviceServiceInfo,
            69 => Self::OwnerServiceInfo,
            70 => Self::Done,
            71 => Self::Done2,
            255 => Self::Error,
            other => return Err(FdoError::malformed(format!("unknown message type {other}"))),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value.id()
    }
}

/// Error codes carried in [`ErrorMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    /// Session token missing, expired or unknown
    InvalidJwtToken,
    /// Message body could not be decoded
    MessageBodyError,
    /// Message decoded but was rejected
    InvalidMessageError,
    /// Owner side failure unrelated to the message content
    InternalServerError,
}

impl ErrorCode {
    /// Numeric code on the wire
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidJwtToken => 1,
            Self::MessageBodyError => 100,
            Self::InvalidMessageError => 101,
            Self::InternalServerError => 500,
        }
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = FdoError;

    fn try_from(value: u16) -> FdoResult<Self> {
        match value {
            1 => Ok(Self::InvalidJwtToken),
            100 => Ok(Self::MessageBodyError),
            101 => Ok(Self::InvalidMessageError),
            500 => Ok(Self::InternalServerError),
            other => Err(FdoError::malformed(format!("unknown error code {other}"))),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.code()
    }
}

cbor_array! {
    /// Protocol error message (type 255)
    ///
    /// `[EMErrorCode, EMPrevMsgID, EMErrorStr, EMErrorTs, EMErrorCID]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ErrorMessage {
        /// Error code
        pub code: ErrorCode,
        /// Message type that triggered the error
        pub prev_msg_id: u8,
        /// Diagnostic text
        pub error_str: String,
        /// Seconds since the Unix epoch, if known
        pub timestamp: Option<u64>,
        /// Correlation identifier for owner-side logs
        pub correlation_id: u64,
    }
}

impl ErrorMessage {
    /// Build an error message describing `error` in reply to `prev_msg_id`
    pub fn from_error(error: &FdoError, prev_msg_id: u8, correlation_id: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|elapsed| elapsed.as_secs());
        Self {
            code: error.error_code(),
            prev_msg_id,
            error_str: error.to_string(),
            timestamp,
            correlation_id,
        }
    }

    /// Error as seen by the receiving party
    ///
    /// Code 101 covers several rejection kinds; it is reported as a sequence
    /// violation.
    pub fn into_error(self) -> FdoError {
        let message = format!(
            "peer rejected message {} (correlation {}): {}",
            self.prev_msg_id, self.correlation_id, self.error_str
        );
        match self.code {
            ErrorCode::InvalidJwtToken => FdoError::unauthorized(message),
            ErrorCode::MessageBodyError => FdoError::malformed(message),
            ErrorCode::InvalidMessageError => FdoError::sequence(message),
            ErrorCode::InternalServerError => FdoError::internal(message),
        }
    }
}
