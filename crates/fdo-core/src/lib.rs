//! FDO Core - shared foundation for the onboarding protocol engines
//!
//! This crate holds what every other FDO crate agrees on: the unified
//! [`FdoError`] taxonomy, the positional CBOR codec used for all wire
//! structures, identifiers such as [`Guid`] and [`Nonce`], and the algorithm
//! tags negotiated in `HelloDevice`.
//!
//! It contains no cryptography and no I/O.

#![forbid(unsafe_code)]

/// Positional CBOR encoding helpers
pub mod codec;

/// Unified error handling
pub mod errors;

/// Message type numbers and the protocol error message
pub mod message;

/// Identifiers, hashes and algorithm tags
pub mod types;

pub use errors::{FdoError, FdoResult};
pub use message::{ErrorCode, ErrorMessage, MessageType};
pub use types::{CipherSuite, Guid, Hash, HashType, KexSuite, Nonce};

/// Default upper bound on a single service-info message, in bytes
pub const DEFAULT_MAX_SERVICE_INFO_SIZE: u16 = 1300;

/// Protocol version written into vouchers and messages
pub const PROTOCOL_VERSION: u16 = 101;
