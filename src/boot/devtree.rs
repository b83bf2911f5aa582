//! Device tree patching on the target.
//!
//! The host never edits the device tree itself. It stages `/chosen`
//! overrides and the initramfs location with the stub, asks the stub to
//! prepare the blob, and then copies the patched result back.
//!
//! ```text
//!   Unpatched ──prepare ok──▶ Prepared ──retrieve──▶ (bytes)
//!       │
//!       └────prepare fails──▶ Failed
//! ```
//!
//! `Failed` is terminal: the target's copy is in an unknown state and every
//! later step depends on it.

use std::fmt;

use crate::error::{Error, Result};
use crate::fdt::{self, HEADER_SIZE};
use crate::memory::MemoryRegion;
use crate::proxy::Proxy;
use crate::session::Session;

const LOG: &str = "proxyboot::fdt";

/// Maximum number of distinct `/chosen` keys the stub accepts.
pub const MAX_CHOSEN_PARAMS: usize = 16;

/// Largest patched device tree accepted back from the target.
pub const MAX_DTB_SIZE: usize = 2 * 1024 * 1024;

/// Where a [`DeviceTree`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtState {
    Unpatched,
    Prepared,
    Failed,
}

impl fmt::Display for DtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtState::Unpatched => write!(f, "unpatched"),
            DtState::Prepared => write!(f, "prepared"),
            DtState::Failed => write!(f, "failed"),
        }
    }
}

/// A device tree blob already written to target memory.
#[derive(Debug, Clone)]
pub struct DeviceTree {
    region: MemoryRegion,
    overrides: Vec<(String, String)>,
    initrd: Option<MemoryRegion>,
    patched: Option<u64>,
    state: DtState,
}

impl DeviceTree {
    /// Track the blob held in `region`.
    pub fn new(region: MemoryRegion) -> Self {
        Self {
            region,
            overrides: Vec::new(),
            initrd: None,
            patched: None,
            state: DtState::Unpatched,
        }
    }

    pub fn state(&self) -> DtState {
        self.state
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// Address of the patched blob, once prepared and retrieved.
    pub fn patched_address(&self) -> Option<u64> {
        self.patched
    }

    pub fn initrd(&self) -> Option<&MemoryRegion> {
        self.initrd.as_ref()
    }

    /// Overrides staged so far, in the order they were first set.
    pub fn overrides(&self) -> impl Iterator<Item = (&str, &str)> {
        self.overrides.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value staged for `key`.
    pub fn override_value(&self, key: &str) -> Option<&str> {
        self.overrides
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Stage a `/chosen` property. Setting a key again replaces its value.
    pub fn set_override<P: Proxy>(
        &mut self,
        session: &mut Session<P>,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.require(DtState::Unpatched)?;
        let known = self.overrides.iter().position(|(k, _)| k == key);
        if known.is_none() && self.overrides.len() >= MAX_CHOSEN_PARAMS {
            return Err(Error::TooManyOverrides(MAX_CHOSEN_PARAMS));
        }

        session.proxy()?.kboot_set_chosen(key, value)?;
        log::debug!(target: LOG, "chosen {} = {:?}", key, value);

        match known {
            Some(i) => self.overrides[i].1 = value.to_string(),
            None => self.overrides.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Tell the target where the initramfs was loaded.
    pub fn register_initrd<P: Proxy>(
        &mut self,
        session: &mut Session<P>,
        region: MemoryRegion,
    ) -> Result<()> {
        self.require(DtState::Unpatched)?;
        session
            .proxy()?
            .kboot_set_initrd(region.address, region.size)?;
        log::debug!(target: LOG, "initrd at {}", region);
        self.initrd = Some(region);
        Ok(())
    }

    /// Have the target patch the blob.
    ///
    /// Any failure, remote status or link error, leaves the tree in
    /// [`DtState::Failed`].
    pub fn prepare<P: Proxy>(&mut self, session: &mut Session<P>) -> Result<()> {
        self.require(DtState::Unpatched)?;

        let status = session
            .proxy()
            .and_then(|proxy| proxy.kboot_prepare_dt(self.region.address));
        match status {
            Ok(0) => {
                self.state = DtState::Prepared;
                log::debug!(target: LOG, "prepared device tree at {:#x}", self.region.address);
                Ok(())
            }
            Ok(status) => {
                self.state = DtState::Failed;
                Err(Error::DeviceTreePrepare(status))
            }
            Err(e) => {
                self.state = DtState::Failed;
                Err(e)
            }
        }
    }

    /// Copy the patched blob back to the host.
    ///
    /// The length comes from the big-endian total size in the blob header.
    pub fn retrieve<P: Proxy>(&mut self, session: &mut Session<P>) -> Result<Vec<u8>> {
        self.require(DtState::Prepared)?;

        let address = session.proxy()?.kboot_get_dt()?;
        if address == 0 {
            return Err(Error::Protocol("target has no prepared device tree".into()));
        }

        let mut channel = session.transfer()?;
        let header = channel.read(address, 8)?;
        let size = fdt::total_size(&header)? as usize;
        if size < HEADER_SIZE {
            return Err(Error::Fdt(format!(
                "total size {} is smaller than the header",
                size
            )));
        }
        if size > MAX_DTB_SIZE {
            return Err(Error::Fdt(format!(
                "total size {} exceeds the {} byte limit",
                size, MAX_DTB_SIZE
            )));
        }
        let blob = channel.read(address, size)?;

        log::debug!(target: LOG, "retrieved {} byte device tree from {:#x}", size, address);
        self.patched = Some(address);
        Ok(blob)
    }

    fn require(&self, state: DtState) -> Result<()> {
        if self.state != state {
            return Err(Error::invalid_state(state, self.state));
        }
        Ok(())
    }
}
