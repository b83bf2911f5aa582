//! Target memory management.
//!
//! The target owns its heap; the host only asks for regions and keeps a
//! ledger of what it was given so that overlapping or unknown regions are
//! caught on the host side.

mod allocator;
mod region;

pub use allocator::Allocator;
pub use region::{MemoryRegion, RegionLedger};

/// Alignment of a kernel image in target memory.
pub const KERNEL_ALIGN: u64 = 2 * 1024 * 1024;

/// Alignment of an initramfs image in target memory.
pub const INITRAMFS_ALIGN: u64 = 64 * 1024;
