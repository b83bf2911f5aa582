//! Flattened device tree (FDT) codec.
//!
//! A blob is laid out as:
//!
//! ```text
//! | header (40) | memory reservation map | structure block | strings block |
//! ```
//!
//! Every header field and every structure token is big-endian. The total
//! size of the blob sits at byte offset 4, which is all the host needs to
//! know to copy a patched blob back from the target; see [`total_size`].

mod builder;
mod tree;

pub use builder::FdtBuilder;
pub use tree::{Fdt, Node, Property};

use crate::error::{Error, Result};

/// Header magic.
pub const FDT_MAGIC: u32 = 0xd00d_feed;
/// Version written by [`FdtBuilder`].
pub const FDT_VERSION: u32 = 17;
/// Oldest version a version-17 blob is compatible with.
pub const FDT_LAST_COMP_VERSION: u32 = 16;
/// Size of the version-17 header.
pub const HEADER_SIZE: usize = 40;

pub(crate) const FDT_BEGIN_NODE: u32 = 0x0000_0001;
pub(crate) const FDT_END_NODE: u32 = 0x0000_0002;
pub(crate) const FDT_PROP: u32 = 0x0000_0003;
pub(crate) const FDT_NOP: u32 = 0x0000_0004;
pub(crate) const FDT_END: u32 = 0x0000_0009;

/// Decode the big-endian total-size field from the first 8 bytes of a blob.
///
/// This does not check the magic; it is the one field needed to know how
/// many bytes to fetch.
pub fn total_size(header: &[u8]) -> Result<u32> {
    let field = header
        .get(4..8)
        .ok_or_else(|| Error::Fdt(format!("need 8 header bytes, got {}", header.len())))?;
    Ok(be32(field, 0))
}

/// Decoded FDT header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtHeader {
    pub magic: u32,
    pub total_size: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Decode and sanity-check a header.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        if blob.len() < HEADER_SIZE {
            return Err(Error::Fdt(format!(
                "blob is {} bytes, shorter than the header",
                blob.len()
            )));
        }

        let header = Self {
            magic: be32(blob, 0),
            total_size: be32(blob, 4),
            off_dt_struct: be32(blob, 8),
            off_dt_strings: be32(blob, 12),
            off_mem_rsvmap: be32(blob, 16),
            version: be32(blob, 20),
            last_comp_version: be32(blob, 24),
            boot_cpuid_phys: be32(blob, 28),
            size_dt_strings: be32(blob, 32),
            size_dt_struct: be32(blob, 36),
        };

        if header.magic != FDT_MAGIC {
            return Err(Error::Fdt(format!("bad magic {:#010x}", header.magic)));
        }
        if header.last_comp_version > FDT_VERSION {
            return Err(Error::Fdt(format!(
                "unsupported version {} (compatible with {})",
                header.version, header.last_comp_version
            )));
        }
        if header.total_size as usize > blob.len() {
            return Err(Error::Fdt(format!(
                "total size {} exceeds the {} bytes available",
                header.total_size,
                blob.len()
            )));
        }

        let total = u64::from(header.total_size);
        let in_bounds = |off: u32, size: u32| u64::from(off) + u64::from(size) <= total;
        if !in_bounds(header.off_dt_struct, header.size_dt_struct)
            || !in_bounds(header.off_dt_strings, header.size_dt_strings)
            || !in_bounds(header.off_mem_rsvmap, 16)
        {
            return Err(Error::Fdt("block offsets run past the total size".into()));
        }

        Ok(header)
    }
}

pub(crate) fn be32(buf: &[u8], off: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(word)
}

pub(crate) fn be64(buf: &[u8], off: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_size_is_big_endian() {
        let header = [0xd0, 0x0d, 0xfe, 0xed, 0x00, 0x00, 0x12, 0x34];
        assert_eq!(total_size(&header).unwrap(), 0x1234);
    }

    #[test]
    fn test_total_size_short_input() {
        assert!(matches!(total_size(&[0u8; 7]), Err(Error::Fdt(_))));
    }

    #[test]
    fn test_header_decode() {
        let mut builder = FdtBuilder::new();
        builder.begin_node("");
        builder.end_node();
        let blob = builder.finish().unwrap();

        let header = FdtHeader::decode(&blob).unwrap();
        assert_eq!(header.magic, FDT_MAGIC);
        assert_eq!(header.version, FDT_VERSION);
        assert_eq!(header.total_size as usize, blob.len());
        assert_eq!(total_size(&blob).unwrap(), header.total_size);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut blob = vec![0u8; HEADER_SIZE];
        blob[..4].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        assert!(matches!(FdtHeader::decode(&blob), Err(Error::Fdt(_))));
    }
}
