//! FDO TO2 - Transfer Ownership 2
//!
//! The owner half of TO2 is [`To2Owner`], a state machine that consumes one
//! device message at a time and keeps its state in a [`SessionStore`]. The
//! device half is [`To2Device`], used by tests and device simulators.
//!
//! Message flow:
//!
//! ```text
//! device                                owner
//!   HelloDevice (60)           ->
//!                              <-  ProveOVHdr (61)        bearer token issued
//!   GetOVNextEntry (62)        ->                         once per voucher entry
//!                              <-  OVNextEntry (63)
//!   ProveDevice (64)           ->
//!                              <-  SetupDevice (65)       encrypted from here on
//!   DeviceServiceInfoReady (66)->
//!                              <-  OwnerServiceInfoReady (67)
//!   DeviceServiceInfo (68)     ->                         until the owner is done
//!                              <-  OwnerServiceInfo (69)
//!   Done (70)                  ->
//!                              <-  Done2 (71)
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod device;
pub mod messages;
pub mod owner;
pub mod service_info;
pub mod session;
pub mod store;
pub mod transport;
pub mod voucher;

pub use config::{ConfigDefaults, ConfigValidation, OwnerConfig, ServiceInfoEntry};
pub use device::{DeviceCredential, To2Device};
pub use owner::To2Owner;
pub use service_info::{ServiceInfo, ServiceInfoKv};
pub use session::{ProtocolSession, To2Stage};
pub use store::{
    MemorySessionStore, MemoryVoucherStore, SessionId, SessionStore, StoreError, VoucherStore,
};
pub use transport::{To2Request, To2Response, CONTENT_TYPE_CBOR};
pub use voucher::{EntryVerifier, OvEntryPayload, OvHeader, OwnershipVoucher, RendezvousInstr};
