//! The boot args record the target firmware hands to the proxy stub.
//!
//! Revision 1 layout, every field little-endian:
//!
//! | offset | field               | type        |
//! |--------|---------------------|-------------|
//! | 0      | revision            | u16         |
//! | 2      | version             | u16         |
//! | 4      | virt_base           | u32         |
//! | 8      | phys_base           | u32         |
//! | 12     | mem_size            | u32         |
//! | 16     | top_of_kernel_data  | u32         |
//! | 20     | video               | 6 x u32     |
//! | 44     | machine_type        | u32         |
//! | 48     | devtree             | u32         |
//! | 52     | devtree_size        | u32         |
//! | 56     | cmdline             | [u8; 256]   |
//! | 312    | boot_flags          | u32         |
//!
//! The record is [`BOOT_ARGS_SIZE`] bytes long.

use std::fmt;

use crate::error::{Error, Result};

/// Length of the kernel command line field.
pub const CMDLINE_LEN: usize = 256;

/// Encoded size of a revision 1 record.
pub const BOOT_ARGS_SIZE: usize = 56 + CMDLINE_LEN + 4;

/// Framebuffer description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoArgs {
    pub base: u32,
    pub display: u32,
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Decoded boot args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArgs {
    pub revision: u16,
    pub version: u16,
    pub virt_base: u32,
    pub phys_base: u32,
    pub mem_size: u32,
    pub top_of_kernel_data: u32,
    pub video: VideoArgs,
    pub machine_type: u32,
    pub devtree: u32,
    pub devtree_size: u32,
    pub cmdline: String,
    pub boot_flags: u32,
}

impl BootArgs {
    /// Decode a revision 1 record.
    ///
    /// Trailing bytes beyond [`BOOT_ARGS_SIZE`] are ignored. The command line
    /// ends at the first NUL.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BOOT_ARGS_SIZE {
            return Err(Error::BootArgs(format!(
                "record is {} bytes, need {}",
                buf.len(),
                BOOT_ARGS_SIZE
            )));
        }

        let revision = le16(buf, 0);
        if revision != 1 {
            return Err(Error::BootArgs(format!("unsupported revision {}", revision)));
        }

        let raw_cmdline = &buf[56..56 + CMDLINE_LEN];
        let end = raw_cmdline.iter().position(|&b| b == 0).unwrap_or(CMDLINE_LEN);
        let cmdline = std::str::from_utf8(&raw_cmdline[..end])
            .map_err(|_| Error::BootArgs("command line is not valid UTF-8".into()))?
            .to_string();

        Ok(Self {
            revision,
            version: le16(buf, 2),
            virt_base: le32(buf, 4),
            phys_base: le32(buf, 8),
            mem_size: le32(buf, 12),
            top_of_kernel_data: le32(buf, 16),
            video: VideoArgs {
                base: le32(buf, 20),
                display: le32(buf, 24),
                stride: le32(buf, 28),
                width: le32(buf, 32),
                height: le32(buf, 36),
                depth: le32(buf, 40),
            },
            machine_type: le32(buf, 44),
            devtree: le32(buf, 48),
            devtree_size: le32(buf, 52),
            cmdline,
            boot_flags: le32(buf, 56 + CMDLINE_LEN),
        })
    }

    /// Encode to the revision 1 layout. A command line longer than the field
    /// is truncated so that it stays NUL-terminated.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BOOT_ARGS_SIZE];
        buf[0..2].copy_from_slice(&self.revision.to_le_bytes());
        buf[2..4].copy_from_slice(&self.version.to_le_bytes());

        let words = [
            (4, self.virt_base),
            (8, self.phys_base),
            (12, self.mem_size),
            (16, self.top_of_kernel_data),
            (20, self.video.base),
            (24, self.video.display),
            (28, self.video.stride),
            (32, self.video.width),
            (36, self.video.height),
            (40, self.video.depth),
            (44, self.machine_type),
            (48, self.devtree),
            (52, self.devtree_size),
            (56 + CMDLINE_LEN, self.boot_flags),
        ];
        for (off, value) in words {
            buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }

        let cmdline = self.cmdline.as_bytes();
        let len = cmdline.len().min(CMDLINE_LEN - 1);
        buf[56..56 + len].copy_from_slice(&cmdline[..len]);
        buf
    }
}

impl fmt::Display for BootArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  revision:     {}", self.revision)?;
        writeln!(f, "  version:      {}", self.version)?;
        writeln!(f, "  virt_base:    {:#x}", self.virt_base)?;
        writeln!(f, "  phys_base:    {:#x}", self.phys_base)?;
        writeln!(f, "  mem_size:     {:#x}", self.mem_size)?;
        writeln!(f, "  top_of_kdata: {:#x}", self.top_of_kernel_data)?;
        writeln!(
            f,
            "  video:        {}x{}x{} stride {} @ {:#x}",
            self.video.width, self.video.height, self.video.depth, self.video.stride, self.video.base
        )?;
        writeln!(f, "  machine_type: {}", self.machine_type)?;
        writeln!(f, "  devtree:      {:#x} ({} bytes)", self.devtree, self.devtree_size)?;
        writeln!(f, "  cmdline:      {:?}", self.cmdline)?;
        write!(f, "  boot_flags:   {:#x}", self.boot_flags)
    }
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BootArgs {
        BootArgs {
            revision: 1,
            version: 2,
            virt_base: 0xfe00_0000,
            phys_base: 0x0800_0000,
            mem_size: 0x8000_0000,
            top_of_kernel_data: 0x0900_0000,
            video: VideoArgs {
                base: 0x1_0000,
                display: 1,
                stride: 2560 * 4,
                width: 2560,
                height: 1600,
                depth: 30,
            },
            machine_type: 0x20,
            devtree: 0x0810_0000,
            devtree_size: 0x2_0000,
            cmdline: "debug".into(),
            boot_flags: 0x4,
        }
    }

    #[test]
    fn test_size() {
        assert_eq!(BOOT_ARGS_SIZE, 316);
    }

    #[test]
    fn test_field_offsets() {
        let buf = sample().encode();
        assert_eq!(&buf[0..2], &[1, 0]);
        assert_eq!(&buf[8..12], &0x0800_0000u32.to_le_bytes());
        assert_eq!(&buf[56..61], b"debug");
        assert_eq!(buf[61], 0);
        assert_eq!(&buf[312..316], &4u32.to_le_bytes());
        assert_eq!(BootArgs::decode(&buf).unwrap(), sample());
    }

    #[test]
    fn test_short_record() {
        let buf = sample().encode();
        let err = BootArgs::decode(&buf[..BOOT_ARGS_SIZE - 1]).unwrap_err();
        assert!(matches!(err, Error::BootArgs(_)));
    }

    #[test]
    fn test_unknown_revision() {
        let mut buf = sample().encode();
        buf[0] = 2;
        assert!(BootArgs::decode(&buf).is_err());
    }

    #[test]
    fn test_unterminated_cmdline() {
        let mut buf = sample().encode();
        buf[56..56 + CMDLINE_LEN].fill(b'x');
        let args = BootArgs::decode(&buf).unwrap();
        assert_eq!(args.cmdline.len(), CMDLINE_LEN);
    }
}
