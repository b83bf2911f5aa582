//! Client for the target heap.

use super::{MemoryRegion, RegionLedger};
use crate::error::{Error, Result};
use crate::proxy::Proxy;

const LOG: &str = "proxyboot::boot";

/// Allocates and frees target memory, keeping the session's ledger in step.
///
/// Every call is one round trip. A zero address from the target means it is
/// out of memory; that is reported as [`Error::OutOfMemory`] and nothing is
/// recorded. An address that breaks the requested alignment or lands on a
/// live region is a protocol violation.
pub struct Allocator<'a, P: ?Sized> {
    proxy: &'a mut P,
    ledger: &'a mut RegionLedger,
}

impl<'a, P: Proxy + ?Sized> Allocator<'a, P> {
    pub fn new(proxy: &'a mut P, ledger: &'a mut RegionLedger) -> Self {
        Self { proxy, ledger }
    }

    /// Allocate `size` bytes from the target heap.
    pub fn allocate(&mut self, size: u64) -> Result<MemoryRegion> {
        check_size(size)?;
        let address = self.proxy.malloc(size)?;
        self.record(MemoryRegion::new(address, size))
    }

    /// Allocate `size` bytes aligned to `alignment`, a power of two.
    pub fn allocate_aligned(&mut self, alignment: u64, size: u64) -> Result<MemoryRegion> {
        check_size(size)?;
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidAllocation(format!(
                "alignment {:#x} is not a power of two",
                alignment
            )));
        }
        let address = self.proxy.memalign(alignment, size)?;
        self.record(MemoryRegion::aligned(address, size, alignment))
    }

    /// Allocate `size` bytes at the highest free target address.
    pub fn allocate_top_of_memory(&mut self, size: u64) -> Result<MemoryRegion> {
        check_size(size)?;
        let address = self.proxy.top_of_memory_alloc(size)?;
        self.record(MemoryRegion::new(address, size))
    }

    /// Release a region previously returned by this session.
    pub fn free(&mut self, region: &MemoryRegion) -> Result<()> {
        if self.ledger.get(region.address).is_none() {
            return Err(Error::UnknownRegion(region.address));
        }
        self.proxy.free(region.address)?;
        self.ledger.remove(region.address)?;
        log::debug!(target: LOG, "freed {}", region);
        Ok(())
    }

    fn record(&mut self, region: MemoryRegion) -> Result<MemoryRegion> {
        if region.address == 0 {
            return Err(Error::OutOfMemory { size: region.size });
        }
        if region.address % region.alignment != 0 {
            return Err(Error::Protocol(format!(
                "target returned {:#x} for a {:#x}-aligned request",
                region.address, region.alignment
            )));
        }
        self.ledger.insert(region)?;
        log::debug!(target: LOG, "allocated {} (align {:#x})", region, region.alignment);
        Ok(region)
    }
}

fn check_size(size: u64) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidAllocation("size must be greater than zero".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;

    #[test]
    fn test_aligned_allocation() {
        let mut target = SimTarget::new();
        let mut ledger = RegionLedger::new();
        let mut alloc = Allocator::new(&mut target, &mut ledger);

        let region = alloc.allocate_aligned(0x20_0000, 0x50_0000).unwrap();
        assert_eq!(region.address % 0x20_0000, 0);
        assert_eq!(region.alignment, 0x20_0000);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_invalid_requests_rejected_locally() {
        let mut target = SimTarget::new();
        let mut ledger = RegionLedger::new();
        let mut alloc = Allocator::new(&mut target, &mut ledger);

        assert!(matches!(alloc.allocate(0), Err(Error::InvalidAllocation(_))));
        assert!(matches!(
            alloc.allocate_aligned(0x3000, 16),
            Err(Error::InvalidAllocation(_))
        ));
        assert!(matches!(
            alloc.allocate_aligned(0, 16),
            Err(Error::InvalidAllocation(_))
        ));
        assert_eq!(target.live_allocations(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let mut target = SimTarget::with_ram(0x8_0000_0000, 0x400_0000);
        let mut ledger = RegionLedger::new();
        let mut alloc = Allocator::new(&mut target, &mut ledger);

        let err = alloc.allocate(0x1_0000_0000).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { size: 0x1_0000_0000 }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_free_round_trip() {
        let mut target = SimTarget::new();
        let mut ledger = RegionLedger::new();
        let mut alloc = Allocator::new(&mut target, &mut ledger);

        let top = alloc.allocate_top_of_memory(0x4000).unwrap();
        let heap = alloc.allocate(0x100).unwrap();
        assert!(top.address > heap.address);

        alloc.free(&heap).unwrap();
        assert!(matches!(alloc.free(&heap), Err(Error::UnknownRegion(_))));
        assert_eq!(ledger.len(), 1);
        assert_eq!(target.live_allocations(), 1);
    }
}
