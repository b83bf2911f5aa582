//! Remote operations executed by the proxy stub on the target.
//!
//! # Architecture
//!
//! ```text
//! Host                                   Target
//! ┌──────────────────┐                  ┌──────────────────┐
//! │ boot orchestrator│                  │                  │
//! │      │           │                  │                  │
//! │      ▼           │                  │                  │
//! │ Session ──Proxy──│──serial frames──▶│ proxy stub       │──▶ kboot / heap / MMIO
//! └──────────────────┘                  └──────────────────┘
//! ```
//!
//! # Protocol
//!
//! ## Request (host → target), 64 bytes
//! ```text
//! | type (4) | payload (56) | checksum (4) |
//! ```
//! - PROXY payload: `opcode (8) | args[6] (48)`
//! - MEMREAD / MEMWRITE payload: `addr (8) | size (8) | data checksum (4) | pad`
//!
//! ## Reply (target → host), 36 bytes
//! ```text
//! | type (4) | status (4) | payload (24) | checksum (4) |
//! ```
//! - PROXY payload: `opcode (8) | status (8) | retval (8)`
//! - memory payload: `data checksum (4) | pad`
//!
//! ## Bulk data
//! A MEMWRITE request is followed by `size` raw bytes; the reply echoes the
//! target's checksum of what it received. A MEMREAD reply is followed by
//! `size` raw bytes covered by the checksum in the reply.

pub mod protocol;
pub mod uart;

use std::time::Duration;

pub use protocol::{Checksum, FrameType, ProxyCall, ProxyResult, Reply, Request};
pub use uart::UartProxy;

use crate::error::Result;

/// The set of remote operations the boot flow relies on.
///
/// Every method is one blocking round trip (or a short fixed sequence of them)
/// over the shared link. Implementations do not retry.
pub trait Proxy {
    /// Read a 32-bit register.
    fn read32(&mut self, addr: u64) -> Result<u32>;

    /// Write a 32-bit register.
    fn write32(&mut self, addr: u64, value: u32) -> Result<()>;

    /// Allocate from the target heap. Returns 0 when out of memory.
    fn malloc(&mut self, size: u64) -> Result<u64>;

    /// Allocate with alignment. Returns 0 when out of memory.
    fn memalign(&mut self, align: u64, size: u64) -> Result<u64>;

    /// Allocate from the top of usable memory. Returns 0 when out of memory.
    fn top_of_memory_alloc(&mut self, size: u64) -> Result<u64>;

    /// Release a heap allocation.
    fn free(&mut self, addr: u64) -> Result<()>;

    /// Copy bytes into target memory.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Copy bytes out of target memory.
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Stage a `/chosen` property for the next device tree prepare.
    fn kboot_set_chosen(&mut self, key: &str, value: &str) -> Result<()>;

    /// Tell the target where the initramfs lives.
    fn kboot_set_initrd(&mut self, addr: u64, size: u64) -> Result<()>;

    /// Patch the device tree at `dtb_addr`. Returns the target's status,
    /// zero on success.
    fn kboot_prepare_dt(&mut self, dtb_addr: u64) -> Result<i64>;

    /// Address of the patched device tree.
    fn kboot_get_dt(&mut self) -> Result<u64>;

    /// Jump into the kernel at `addr`. The stub stops serving requests.
    fn kboot_boot(&mut self, addr: u64) -> Result<()>;

    /// Address of the boot args record.
    fn get_bootargs(&mut self) -> Result<u64>;

    /// Load address of the proxy stub itself.
    fn get_base(&mut self) -> Result<u64>;

    /// Current reply timeout of the link.
    fn timeout(&self) -> Duration;

    /// Change the reply timeout of the link.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Turn the link into an interactive console. Does not return until the
    /// console is closed.
    fn ttymode(&mut self) -> Result<()>;
}

impl<P: Proxy + ?Sized> Proxy for Box<P> {
    fn read32(&mut self, addr: u64) -> Result<u32> {
        (**self).read32(addr)
    }
    fn write32(&mut self, addr: u64, value: u32) -> Result<()> {
        (**self).write32(addr, value)
    }
    fn malloc(&mut self, size: u64) -> Result<u64> {
        (**self).malloc(size)
    }
    fn memalign(&mut self, align: u64, size: u64) -> Result<u64> {
        (**self).memalign(align, size)
    }
    fn top_of_memory_alloc(&mut self, size: u64) -> Result<u64> {
        (**self).top_of_memory_alloc(size)
    }
    fn free(&mut self, addr: u64) -> Result<()> {
        (**self).free(addr)
    }
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        (**self).write_memory(addr, data)
    }
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read_memory(addr, len)
    }
    fn kboot_set_chosen(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).kboot_set_chosen(key, value)
    }
    fn kboot_set_initrd(&mut self, addr: u64, size: u64) -> Result<()> {
        (**self).kboot_set_initrd(addr, size)
    }
    fn kboot_prepare_dt(&mut self, dtb_addr: u64) -> Result<i64> {
        (**self).kboot_prepare_dt(dtb_addr)
    }
    fn kboot_get_dt(&mut self) -> Result<u64> {
        (**self).kboot_get_dt()
    }
    fn kboot_boot(&mut self, addr: u64) -> Result<()> {
        (**self).kboot_boot(addr)
    }
    fn get_bootargs(&mut self) -> Result<u64> {
        (**self).get_bootargs()
    }
    fn get_base(&mut self) -> Result<u64> {
        (**self).get_base()
    }
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }
    fn ttymode(&mut self) -> Result<()> {
        (**self).ttymode()
    }
}
