//! Target memory region bookkeeping.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// A region of target physical memory handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Target physical address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// Alignment the region was requested with (1 when unconstrained)
    pub alignment: u64,
}

impl MemoryRegion {
    pub fn new(address: u64, size: u64) -> Self {
        Self {
            address,
            size,
            alignment: 1,
        }
    }

    pub fn aligned(address: u64, size: u64, alignment: u64) -> Self {
        Self {
            address,
            size,
            alignment,
        }
    }

    /// One past the last byte, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.end()
    }

    /// Get the offset of an address within this region.
    pub fn offset(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.address)
        } else {
            None
        }
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.address < other.end() && other.address < self.end()
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.address, self.end())
    }
}

/// Regions that are currently allocated in one session.
#[derive(Debug, Default)]
pub struct RegionLedger {
    live: BTreeMap<u64, MemoryRegion>,
}

impl RegionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh allocation.
    ///
    /// Fails with [`Error::OverlappingRegion`] if it intersects a live region,
    /// which means the target handed out memory it had already handed out.
    pub fn insert(&mut self, region: MemoryRegion) -> Result<()> {
        // Only the closest live region on each side can overlap.
        let below = self.live.range(..=region.address).next_back();
        let above = self.live.range(region.address..).next();
        for live in below.into_iter().chain(above).map(|(_, r)| r) {
            if live.overlaps(&region) {
                return Err(Error::OverlappingRegion {
                    addr: region.address,
                    end: region.end(),
                    live: live.address,
                });
            }
        }
        self.live.insert(region.address, region);
        Ok(())
    }

    /// Forget a region by its start address.
    pub fn remove(&mut self, address: u64) -> Result<MemoryRegion> {
        self.live
            .remove(&address)
            .ok_or(Error::UnknownRegion(address))
    }

    pub fn get(&self, address: u64) -> Option<&MemoryRegion> {
        self.live.get(&address)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
