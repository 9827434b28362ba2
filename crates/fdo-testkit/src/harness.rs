//! An owner wired to in-memory stores, plus a driver for full TO2 runs

use fdo_core::{CipherSuite, FdoResult, KexSuite};
use fdo_to2::{
    MemorySessionStore, MemoryVoucherStore, OwnerConfig, ServiceInfo, To2Device, To2Owner,
    To2Request, To2Response,
};

use crate::voucher::VoucherFixture;

/// Owner serving one fixture voucher
pub struct OwnerHarness {
    /// Owner under test
    pub owner: To2Owner<MemorySessionStore, MemoryVoucherStore>,
    /// Session store shared with the owner
    pub sessions: MemorySessionStore,
    /// Voucher store shared with the owner
    pub vouchers: MemoryVoucherStore,
    /// Device and voucher the owner serves
    pub fixture: VoucherFixture,
}

impl OwnerHarness {
    /// Owner with default configuration and a one-entry P-256 voucher
    pub async fn new() -> Self {
        Self::with(OwnerConfig::default(), VoucherFixture::builder().build()).await
    }

    /// Owner with the given configuration and voucher
    pub async fn with(config: OwnerConfig, fixture: VoucherFixture) -> Self {
        let sessions = MemorySessionStore::with_ttl(config.session_ttl());
        let vouchers = MemoryVoucherStore::new();
        vouchers
            .insert(&fixture.voucher)
            .await
            .expect("store voucher");
        let owner = To2Owner::new(
            config,
            fixture.owner_key().clone(),
            sessions.clone(),
            vouchers.clone(),
        )
        .expect("owner");
        Self {
            owner,
            sessions,
            vouchers,
            fixture,
        }
    }

    /// Device for the fixture voucher
    pub fn device(&self, kex_suite: KexSuite, cipher_suite: CipherSuite) -> To2Device {
        To2Device::new(self.fixture.credential(), kex_suite, cipher_suite)
    }

    /// Send one request to the owner
    pub async fn send(&self, request: To2Request) -> To2Response {
        self.owner.handle(request).await
    }

    /// Drive `device` from HelloDevice through Done2
    pub async fn run(&self, device: &mut To2Device) -> FdoResult<()> {
        self.run_until_done(device).await?;
        let response = self.send(device.done()?).await;
        device.process_done2(&response)
    }

    /// Drive `device` through the service info exchange, stopping before Done
    pub async fn run_until_done(&self, device: &mut To2Device) -> FdoResult<()> {
        let response = self.send(device.hello_device()?).await;
        device.process_prove_ov_hdr(&response)?;

        while let Some(index) = device.next_entry() {
            let response = self.send(device.get_ov_next_entry(index)?).await;
            device.process_ov_next_entry(&response)?;
        }

        let response = self.send(device.prove_device()?).await;
        device.process_setup_device(&response)?;

        let response = self.send(device.device_service_info_ready(None)?).await;
        device.process_owner_service_info_ready(&response)?;

        loop {
            let response = self.send(device.device_service_info()?).await;
            if device.process_owner_service_info(&response)? {
                return Ok(());
            }
        }
    }

    /// Run a device that sends `service_info` and return what the owner sent back
    pub async fn run_with_service_info(
        &self,
        kex_suite: KexSuite,
        cipher_suite: CipherSuite,
        service_info: ServiceInfo,
    ) -> FdoResult<ServiceInfo> {
        let mut device = self
            .device(kex_suite, cipher_suite)
            .with_service_info(service_info);
        self.run(&mut device).await?;
        Ok(device.owner_service_info().to_vec())
    }
}
