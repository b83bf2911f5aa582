//! Loading and booting a Linux kernel through the proxy.
//!
//! A [`BootPlan`] holds the host-side images. An [`Orchestrator`] walks a
//! [`Session`] through the fixed sequence of remote steps:
//!
//! ```text
//! Validating ─▶ LoadingDtb ─▶ StagingBootargs ─▶ LoadingInitramfs ─▶ PreparingDt
//!     ─▶ RetrievingDt ─▶ LoadingKernel ─▶ LoadingUBoot ─▶ Ready
//! ```
//!
//! Each step needs the one before it. A failure anywhere moves the
//! orchestrator to [`BootStage::Failed`] and stays there. Nothing already
//! allocated or written on the target is undone.
//!
//! ## Example
//!
//! ```rust,no_run
//! use proxyboot::boot::{BootPlan, Orchestrator};
//! use proxyboot::sim::SimTarget;
//! use proxyboot::{Session, SessionConfig};
//!
//! # fn main() -> proxyboot::Result<()> {
//! let plan = BootPlan::from_files("Image".as_ref(), "board.dtb".as_ref(), None)?
//!     .bootargs("console=ttySAC0,1500000");
//!
//! let mut session = Session::new(SimTarget::new(), SessionConfig::default())?;
//! let staged = Orchestrator::new(&mut session).load(&plan)?;
//! session.boot(staged.request)?;
//! # Ok(())
//! # }
//! ```

pub mod devtree;
pub mod handoff;

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use devtree::{DeviceTree, DtState, MAX_CHOSEN_PARAMS};
pub use handoff::BootRequest;

use crate::error::{Error, Result};
use crate::memory::{MemoryRegion, INITRAMFS_ALIGN, KERNEL_ALIGN};
use crate::proxy::Proxy;
use crate::session::Session;
use crate::transfer::{validate_length, Payload};

const LOG: &str = "proxyboot::boot";

/// Compression format hint for the kernel image.
///
/// The hint is recorded and passed to the [`ImageDecoder`]; the stock
/// decoder sends every image as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Auto,
    None,
    Gz,
    Xz,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Auto => "auto",
            Compression::None => "none",
            Compression::Gz => "gz",
            Compression::Xz => "xz",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Compression::Auto),
            "none" => Ok(Compression::None),
            "gz" => Ok(Compression::Gz),
            "xz" => Ok(Compression::Xz),
            other => Err(Error::Config(format!(
                "unknown compression {:?} (expected auto, none, gz or xz)",
                other
            ))),
        }
    }
}

/// Turns a kernel file into the bytes the target should receive.
pub trait ImageDecoder {
    /// Size of the decoded image. Zero or negative when the image cannot be
    /// decoded.
    fn decoded_size(&self, image: &[u8], compression: Compression) -> i64;

    /// Decode `image`.
    fn decode<'a>(&self, image: &'a [u8], compression: Compression) -> Result<Cow<'a, [u8]>>;
}

/// Passes images through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ImageDecoder for Identity {
    fn decoded_size(&self, image: &[u8], _compression: Compression) -> i64 {
        i64::try_from(image.len()).unwrap_or(-1)
    }

    fn decode<'a>(&self, image: &'a [u8], _compression: Compression) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(image))
    }
}

/// Images and options for one boot.
#[derive(Debug, Clone, Default)]
pub struct BootPlan {
    pub kernel: Vec<u8>,
    pub dtb: Vec<u8>,
    pub initramfs: Option<Vec<u8>>,
    /// Loaded after the kernel and entered instead of it.
    pub u_boot: Option<Vec<u8>>,
    pub bootargs: Option<String>,
    pub compression: Compression,
    /// Where to save the patched device tree.
    pub retrieve: Option<PathBuf>,
}

impl BootPlan {
    pub fn new(kernel: Vec<u8>, dtb: Vec<u8>) -> Self {
        Self {
            kernel,
            dtb,
            ..Default::default()
        }
    }

    /// Read the kernel, device tree and optional initramfs from disk.
    pub fn from_files(kernel: &Path, dtb: &Path, initramfs: Option<&Path>) -> Result<Self> {
        let mut plan = Self::new(read_payload(kernel)?, read_payload(dtb)?);
        if let Some(path) = initramfs {
            plan.initramfs = Some(read_payload(path)?);
        }
        Ok(plan)
    }

    pub fn initramfs(mut self, image: Vec<u8>) -> Self {
        self.initramfs = Some(image);
        self
    }

    pub fn u_boot(mut self, image: Vec<u8>) -> Self {
        self.u_boot = Some(image);
        self
    }

    /// Set the kernel command line (`/chosen/bootargs`).
    pub fn bootargs(mut self, bootargs: impl Into<String>) -> Self {
        self.bootargs = Some(bootargs.into());
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn retrieve_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.retrieve = Some(path.into());
        self
    }
}

/// Read an image file. A missing file is [`Error::PayloadNotFound`].
pub fn read_payload(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::PayloadNotFound(path.to_path_buf()),
        _ => Error::Io(e),
    })
}

/// Orchestrator progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Idle,
    Validating,
    LoadingDtb,
    StagingBootargs,
    LoadingInitramfs,
    PreparingDt,
    RetrievingDt,
    LoadingKernel,
    LoadingUBoot,
    Ready,
    Failed,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStage::Idle => "idle",
            BootStage::Validating => "validating",
            BootStage::LoadingDtb => "loading dtb",
            BootStage::StagingBootargs => "staging bootargs",
            BootStage::LoadingInitramfs => "loading initramfs",
            BootStage::PreparingDt => "preparing dt",
            BootStage::RetrievingDt => "retrieving dt",
            BootStage::LoadingKernel => "loading kernel",
            BootStage::LoadingUBoot => "loading u-boot",
            BootStage::Ready => "ready",
            BootStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What [`Orchestrator::load`] left on the target.
#[derive(Debug, Clone)]
pub struct Staged {
    /// Ready for [`Session::boot`].
    pub request: BootRequest,
    pub devtree: DeviceTree,
    /// Host copy of the patched device tree.
    pub patched_dtb: Vec<u8>,
    pub initramfs: Option<MemoryRegion>,
    pub u_boot: Option<MemoryRegion>,
}

/// Drives a session through the boot sequence.
pub struct Orchestrator<'s, P: Proxy> {
    session: &'s mut Session<P>,
    decoder: Box<dyn ImageDecoder>,
    stage: BootStage,
    failed_at: Option<BootStage>,
}

impl<'s, P: Proxy> Orchestrator<'s, P> {
    pub fn new(session: &'s mut Session<P>) -> Self {
        Self {
            session,
            decoder: Box::new(Identity),
            stage: BootStage::Idle,
            failed_at: None,
        }
    }

    /// Use `decoder` for the kernel image.
    pub fn with_decoder(mut self, decoder: impl ImageDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// The stage that failed, if any.
    pub fn failed_at(&self) -> Option<BootStage> {
        self.failed_at
    }

    /// Put every image in place and prepare the device tree.
    ///
    /// Image sizes are all checked before the first write to the target.
    pub fn load(&mut self, plan: &BootPlan) -> Result<Staged> {
        if self.stage != BootStage::Idle {
            return Err(Error::invalid_state(BootStage::Idle, self.stage));
        }
        match self.run(plan) {
            Ok(staged) => {
                self.enter(BootStage::Ready);
                log::info!(target: LOG, "Ready to boot");
                Ok(staged)
            }
            Err(e) => {
                log::debug!(target: LOG, "boot sequence failed while {}: {}", self.stage, e);
                self.failed_at = Some(self.stage);
                self.stage = BootStage::Failed;
                Err(e)
            }
        }
    }

    /// [`load`](Self::load), then jump into the image.
    pub fn boot(mut self, plan: &BootPlan) -> Result<Staged> {
        let staged = self.load(plan)?;
        self.session.boot(staged.request.clone())?;
        Ok(staged)
    }

    fn enter(&mut self, stage: BootStage) {
        log::debug!(target: LOG, "{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    fn run(&mut self, plan: &BootPlan) -> Result<Staged> {
        self.enter(BootStage::Validating);
        self.session.check_active()?;
        let kernel_size = validate_length(self.decoder.decoded_size(&plan.kernel, plan.compression))?;
        let dtb_size = validate_length(plan.dtb.len() as i64)?;
        let initramfs_size = match &plan.initramfs {
            Some(image) => Some(validate_length(image.len() as i64)?),
            None => None,
        };
        let u_boot_size = match &plan.u_boot {
            Some(image) => Some(validate_length(image.len() as i64)?),
            None => None,
        };
        if plan.compression != Compression::Auto {
            log::debug!(target: LOG, "kernel compression hint: {}", plan.compression);
        }

        self.enter(BootStage::LoadingDtb);
        let dtb_region = self.session.allocator()?.allocate_top_of_memory(dtb_size)?;
        log::info!(target: LOG, "Loading DTB to {:#x}...", dtb_region.address);
        let dtb = Payload::new(&plan.dtb[..], dtb_region)?;
        self.session.transfer()?.write_payload(&dtb)?;
        let mut devtree = DeviceTree::new(dtb_region);

        if let Some(bootargs) = &plan.bootargs {
            self.enter(BootStage::StagingBootargs);
            log::info!(target: LOG, "Setting boot args: {:?}", bootargs);
            devtree.set_override(self.session, "bootargs", bootargs)?;
        }

        let initramfs = match (&plan.initramfs, initramfs_size) {
            (Some(image), Some(size)) => {
                self.enter(BootStage::LoadingInitramfs);
                let region = self
                    .session
                    .allocator()?
                    .allocate_aligned(INITRAMFS_ALIGN, size)?;
                log::info!(
                    target: LOG,
                    "Loading {} initramfs bytes to {:#x}...",
                    size,
                    region.address
                );
                let payload = Payload::new(&image[..], region)?;
                self.session.transfer()?.write_payload(&payload)?;
                devtree.register_initrd(self.session, region)?;
                Some(region)
            }
            _ => None,
        };

        self.enter(BootStage::PreparingDt);
        devtree.prepare(self.session)?;

        self.enter(BootStage::RetrievingDt);
        let patched_dtb = devtree.retrieve(self.session)?;
        log::debug!(target: LOG, "total size {}", patched_dtb.len());
        if let Some(path) = &plan.retrieve {
            std::fs::write(path, &patched_dtb)?;
            log::info!(target: LOG, "Saved patched device tree to {}", path.display());
        }

        self.enter(BootStage::LoadingKernel);
        let kernel = self.decoder.decode(&plan.kernel, plan.compression)?;
        if kernel.len() as u64 != kernel_size {
            return Err(Error::InvalidTransferSize(kernel.len() as i64));
        }
        let kernel_region = self
            .session
            .allocator()?
            .allocate_aligned(KERNEL_ALIGN, kernel_size)?;
        log::info!(target: LOG, "Kernel_base: {:#x}", kernel_region.address);
        log::info!(
            target: LOG,
            "Loading {} bytes to {:#x}..{:#x}...",
            kernel_size,
            kernel_region.address,
            kernel_region.end()
        );
        let kernel = Payload::new(kernel, kernel_region)?;
        self.session.transfer()?.write_payload(&kernel)?;

        let mut request = BootRequest::new(kernel_region, &devtree)?;

        let u_boot = match (&plan.u_boot, u_boot_size) {
            (Some(image), Some(size)) => {
                self.enter(BootStage::LoadingUBoot);
                let region = self
                    .session
                    .allocator()?
                    .allocate_aligned(KERNEL_ALIGN, size)?;
                log::info!(
                    target: LOG,
                    "Loading {} u-boot bytes to {:#x}...",
                    size,
                    region.address
                );
                let payload = Payload::new(&image[..], region)?;
                self.session.transfer()?.write_payload(&payload)?;
                request = request.chainload(&region);
                Some(region)
            }
            _ => None,
        };

        Ok(Staged {
            request,
            devtree,
            patched_dtb,
            initramfs,
            u_boot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::fdt::{Fdt, FdtBuilder};
    use crate::session::SessionState;
    use crate::sim::SimTarget;

    fn dtb() -> Vec<u8> {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.property_string("compatible", "apple,j274");
        b.property_u32("#address-cells", 2);
        b.property_u32("#size-cells", 2);
        b.end_node();
        b.finish().unwrap()
    }

    fn session() -> Session<SimTarget> {
        Session::new(SimTarget::new(), SessionConfig::default()).unwrap()
    }

    struct Broken;

    impl ImageDecoder for Broken {
        fn decoded_size(&self, _image: &[u8], _compression: Compression) -> i64 {
            -1
        }

        fn decode<'a>(&self, image: &'a [u8], _: Compression) -> Result<Cow<'a, [u8]>> {
            Ok(Cow::Borrowed(image))
        }
    }

    // Reports a smaller size than it decodes to.
    struct Growing;

    impl ImageDecoder for Growing {
        fn decoded_size(&self, image: &[u8], _compression: Compression) -> i64 {
            image.len() as i64
        }

        fn decode<'a>(&self, image: &'a [u8], _: Compression) -> Result<Cow<'a, [u8]>> {
            let mut out = image.to_vec();
            out.extend_from_slice(image);
            Ok(Cow::Owned(out))
        }
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!("xz".parse::<Compression>().unwrap(), Compression::Xz);
        assert_eq!(Compression::default(), Compression::Auto);
        assert!("lz4".parse::<Compression>().is_err());
    }

    #[test]
    fn test_full_sequence() {
        let mut session = session();
        let plan = BootPlan::new(vec![0x14; 0x3000], dtb())
            .initramfs(vec![0x1f; 0x1800])
            .bootargs("console=ttySAC0");

        let staged = Orchestrator::new(&mut session).boot(&plan).unwrap();

        assert_eq!(staged.request.kernel_region().address % KERNEL_ALIGN, 0);
        assert_eq!(staged.request.entry(), staged.request.kernel_region().address);
        assert_eq!(staged.initramfs.unwrap().address % INITRAMFS_ALIGN, 0);
        assert_eq!(staged.devtree.state(), DtState::Prepared);
        assert_eq!(session.state(), SessionState::HandedOff);

        let tree = Fdt::parse(&staged.patched_dtb).unwrap();
        assert_eq!(
            tree.node("/chosen").unwrap().property_str("bootargs"),
            Some("console=ttySAC0")
        );
    }

    #[test]
    fn test_bad_size_writes_nothing() {
        let mut session = session();
        let plan = BootPlan::new(vec![0; 16], dtb());

        let mut orchestrator = Orchestrator::new(&mut session).with_decoder(Broken);
        let err = orchestrator.load(&plan).unwrap_err();
        assert!(matches!(err, Error::InvalidTransferSize(-1)));
        assert_eq!(orchestrator.stage(), BootStage::Failed);
        assert_eq!(orchestrator.failed_at(), Some(BootStage::Validating));
        drop(orchestrator);

        let target = session.into_inner();
        assert_eq!(target.memory_writes(), 0);
        assert_eq!(target.live_allocations(), 0);
    }

    #[test]
    fn test_oversized_kernel_never_written() {
        let mut session = session();
        let plan = BootPlan::new(vec![0x7f; 0x800], dtb());

        let mut orchestrator = Orchestrator::new(&mut session).with_decoder(Growing);
        assert!(matches!(
            orchestrator.load(&plan),
            Err(Error::InvalidTransferSize(0x1000))
        ));
        assert_eq!(orchestrator.failed_at(), Some(BootStage::LoadingKernel));
        drop(orchestrator);

        // Only the device tree reached the target.
        assert_eq!(session.regions().len(), 1);
        assert_eq!(session.into_inner().memory_writes(), 1);
    }

    #[test]
    fn test_empty_initramfs_rejected_up_front() {
        let mut session = session();
        let plan = BootPlan::new(vec![0; 16], dtb()).initramfs(Vec::new());
        let mut orchestrator = Orchestrator::new(&mut session);
        assert!(matches!(
            orchestrator.load(&plan),
            Err(Error::InvalidTransferSize(0))
        ));
        drop(orchestrator);
        assert_eq!(session.into_inner().memory_writes(), 0);
    }

    #[test]
    fn test_prepare_failure_leaves_allocations() {
        let mut session = session();
        session.proxy().unwrap().fail_next_prepare(-1);
        let plan = BootPlan::new(vec![0; 16], dtb());

        let mut orchestrator = Orchestrator::new(&mut session);
        assert!(matches!(
            orchestrator.load(&plan),
            Err(Error::DeviceTreePrepare(-1))
        ));
        assert_eq!(orchestrator.failed_at(), Some(BootStage::PreparingDt));
        assert!(orchestrator.load(&plan).is_err());
        drop(orchestrator);

        assert_eq!(session.regions().len(), 1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_u_boot_is_entry() {
        let mut session = session();
        let plan = BootPlan::new(vec![1; 0x100], dtb()).u_boot(vec![2; 0x100]);

        let staged = Orchestrator::new(&mut session).load(&plan).unwrap();
        let u_boot = staged.u_boot.unwrap();
        assert_eq!(staged.request.entry(), u_boot.address);
        assert_ne!(u_boot.address, staged.request.kernel_region().address);
        assert_eq!(u_boot.address % KERNEL_ALIGN, 0);
    }

    #[test]
    fn test_missing_payload() {
        let err = BootPlan::from_files(
            Path::new("/nonexistent/Image"),
            Path::new("/nonexistent/board.dtb"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PayloadNotFound(_)));
    }
}
