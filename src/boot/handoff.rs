//! Handing the target CPU to the loaded image.

use super::devtree::{DeviceTree, DtState};
use crate::error::{Error, Result};
use crate::memory::MemoryRegion;
use crate::proxy::Proxy;
use crate::session::{Session, SessionState};

const LOG: &str = "proxyboot::boot";

/// Everything the target needs to jump into a kernel.
///
/// Only built once every payload is written and the device tree is prepared,
/// and consumed by [`Session::boot`]. [`BootRequest::new`] is the only way to
/// get one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRequest {
    kernel_region: MemoryRegion,
    dtb_region: MemoryRegion,
    entry: u64,
}

impl BootRequest {
    /// Build a request for the kernel in `kernel_region`.
    pub fn new(kernel_region: MemoryRegion, devtree: &DeviceTree) -> Result<Self> {
        if devtree.state() != DtState::Prepared {
            return Err(Error::invalid_state(DtState::Prepared, devtree.state()));
        }
        Ok(Self {
            kernel_region,
            dtb_region: *devtree.region(),
            entry: kernel_region.address,
        })
    }

    /// Enter through another image (u-boot) that then starts the kernel.
    pub fn chainload(mut self, image: &MemoryRegion) -> Self {
        self.entry = image.address;
        self
    }

    pub fn kernel_region(&self) -> &MemoryRegion {
        &self.kernel_region
    }

    pub fn dtb_region(&self) -> &MemoryRegion {
        &self.dtb_region
    }

    /// Address the CPU jumps to. The kernel base unless chainloading.
    pub fn entry(&self) -> u64 {
        self.entry
    }
}

impl<P: Proxy> Session<P> {
    /// Jump into the loaded image.
    ///
    /// On success the session is handed off and no further remote operation
    /// is accepted; only [`attach_console`](Self::attach_console) remains.
    pub fn boot(&mut self, request: BootRequest) -> Result<()> {
        self.check_active()?;
        log::info!(
            target: LOG,
            "Booting {:#x} (kernel {}, dtb {})",
            request.entry,
            request.kernel_region,
            request.dtb_region
        );
        self.proxy.kboot_boot(request.entry)?;
        self.state = SessionState::HandedOff;
        Ok(())
    }

    /// Turn the link into an interactive console for the booted kernel.
    ///
    /// Returns when the console is closed.
    pub fn attach_console(&mut self) -> Result<()> {
        if self.state != SessionState::HandedOff {
            return Err(Error::invalid_state(SessionState::HandedOff, self.state));
        }
        self.proxy.ttymode()
    }
}
