//! Unified error system for the FDO protocol core
//!
//! Every engine returns an [`FdoError`]. The owner state machine maps each kind
//! onto an FDO `ErrorMessage` code and an HTTP status class, so the set of kinds is
//! intentionally small and stable.

use serde::{Deserialize, Serialize};

use crate::message::ErrorCode;

/// Unified error type for all FDO operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FdoError {
    /// Structurally invalid input: bad CBOR, wrong lengths, unparsable keys or certificates
    #[error("Malformed input: {message}")]
    MalformedInput {
        /// Error message describing what could not be parsed
        message: String,
    },

    /// Missing or unknown session token
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Error message describing the rejected credential
        message: String,
    },

    /// Message arrived out of order, or a nonce did not match
    #[error("Protocol sequence violation: {message}")]
    ProtocolSequenceViolation {
        /// Error message describing the ordering problem
        message: String,
    },

    /// Signature, MAC, hash or certificate path check failed
    #[error("Verification failed: {message}")]
    VerificationFailed {
        /// Error message describing the failed check
        message: String,
    },

    /// Algorithm, suite or encoding that is recognized but not implemented
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// Error message naming the unsupported algorithm
        message: String,
    },

    /// Unexpected failure inside the crypto backend or a store
    #[error("Internal failure: {message}")]
    InternalFailure {
        /// Error message describing the internal error
        message: String,
    },
}

impl FdoError {
    /// Create a malformed input error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a protocol sequence violation
    pub fn sequence(message: impl Into<String>) -> Self {
        Self::ProtocolSequenceViolation {
            message: message.into(),
        }
    }

    /// Create a verification failure
    pub fn verification(message: impl Into<String>) -> Self {
        Self::VerificationFailed {
            message: message.into(),
        }
    }

    /// Create an unsupported algorithm error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm {
            message: message.into(),
        }
    }

    /// Create an internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalFailure {
            message: message.into(),
        }
    }

    /// Human readable detail without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Self::MalformedInput { message }
            | Self::Unauthorized { message }
            | Self::ProtocolSequenceViolation { message }
            | Self::VerificationFailed { message }
            | Self::UnsupportedAlgorithm { message }
            | Self::InternalFailure { message } => message,
        }
    }

    /// FDO error code carried in the `ErrorMessage` sent to the peer
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MalformedInput { .. } => ErrorCode::MessageBodyError,
            Self::Unauthorized { .. } => ErrorCode::InvalidJwtToken,
            Self::ProtocolSequenceViolation { .. }
            | Self::VerificationFailed { .. }
            | Self::UnsupportedAlgorithm { .. } => ErrorCode::InvalidMessageError,
            Self::InternalFailure { .. } => ErrorCode::InternalServerError,
        }
    }

    /// HTTP status class for the transport envelope
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::InternalFailure { .. } => 500,
            _ => 400,
        }
    }
}

/// Standard Result type for FDO operations
pub type FdoResult<T> = std::result::Result<T, FdoError>;

impl From<serde_cbor::Error> for FdoError {
    fn from(err: serde_cbor::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::malformed(format!("CBOR decoding failed: {err}"))
        } else {
            Self::internal(format!("CBOR codec failure: {err}"))
        }
    }
}

impl From<std::io::Error> for FdoError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = FdoError::malformed("short blob");
        assert!(matches!(err, FdoError::MalformedInput { .. }));
        assert_eq!(err.to_string(), "Malformed input: short blob");
        assert_eq!(err.message(), "short blob");
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(FdoError::malformed("x").error_code(), ErrorCode::MessageBodyError);
        assert_eq!(FdoError::malformed("x").http_status(), 400);
        assert_eq!(FdoError::unauthorized("x").error_code(), ErrorCode::InvalidJwtToken);
        assert_eq!(FdoError::unauthorized("x").http_status(), 401);
        assert_eq!(FdoError::sequence("x").error_code(), ErrorCode::InvalidMessageError);
        assert_eq!(FdoError::verification("x").http_status(), 400);
        assert_eq!(FdoError::unsupported("x").error_code(), ErrorCode::InvalidMessageError);
        assert_eq!(FdoError::internal("x").error_code(), ErrorCode::InternalServerError);
        assert_eq!(FdoError::internal("x").http_status(), 500);
    }

    #[test]
    fn test_cbor_error_conversion() {
        let err = serde_cbor::from_slice::<u8>(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(FdoError::from(err), FdoError::MalformedInput { .. }));
    }
}
