//! FDO Testing Infrastructure
//!
//! Fixtures shared by the integration tests of `fdo-crypto` and `fdo-to2`:
//! generated keys, X.509 chains, ownership vouchers extended to a test owner,
//! and a harness that wires a [`fdo_to2::To2Owner`] to in-memory stores.
//!
//! Only use this crate from `tests/` directories. Unit tests inside
//! `fdo-crypto` or `fdo-to2` would see two copies of those crates.
//!
//! ```rust,no_run
//! use fdo_testkit::{init_tracing, VoucherFixture};
//!
//! init_tracing();
//! let fixture = VoucherFixture::builder().entries(2).build();
//! assert_eq!(fixture.voucher.entries.len(), 2);
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod certs;
pub mod harness;
pub mod keys;
pub mod voucher;

pub use certs::CertChain;
pub use harness::OwnerHarness;
pub use keys::test_key;
pub use voucher::{VoucherFixture, VoucherFixtureBuilder};

use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
