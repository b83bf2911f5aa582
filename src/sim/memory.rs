//! Sparse byte-addressable RAM for the simulated target.

use std::collections::BTreeMap;

const PAGE_SHIFT: u32 = 14;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Pages are materialised on first write; unwritten memory reads as zero.
#[derive(Debug, Default)]
pub struct SparseMemory {
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let mut addr = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let chunk = rest.len().min(PAGE_SIZE - offset);
            let page = self
                .pages
                .entry(addr >> PAGE_SHIFT)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            page[offset..offset + chunk].copy_from_slice(&rest[..chunk]);
            addr += chunk as u64;
            rest = &rest[chunk..];
        }
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut addr = addr;
        while out.len() < len {
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let chunk = (len - out.len()).min(PAGE_SIZE - offset);
            match self.pages.get(&(addr >> PAGE_SHIFT)) {
                Some(page) => out.extend_from_slice(&page[offset..offset + chunk]),
                None => out.resize(out.len() + chunk, 0),
            }
            addr += chunk as u64;
        }
        out
    }

    /// Number of pages that have been written.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}
