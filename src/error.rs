//! Error types for proxyboot.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using proxyboot's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a target through the proxy.
///
/// Every variant is fatal to a boot sequence: nothing in this crate retries a
/// failed remote operation or rolls back earlier steps.
#[derive(Error, Debug)]
pub enum Error {
    // Allocation errors
    #[error("target out of memory allocating {size:#x} bytes")]
    OutOfMemory { size: u64 },

    #[error("invalid allocation request: {0}")]
    InvalidAllocation(String),

    #[error("target returned region 0x{addr:x}..0x{end:x} overlapping live region 0x{live:x}")]
    OverlappingRegion { addr: u64, end: u64, live: u64 },

    #[error("address 0x{0:x} is not a live allocation")]
    UnknownRegion(u64),

    // Transfer errors
    #[error("invalid transfer size {0} (decompression error?)")]
    InvalidTransferSize(i64),

    #[error("payload not found: {0}")]
    PayloadNotFound(PathBuf),

    // Device tree errors
    #[error("device tree prepare failed (status {0})")]
    DeviceTreePrepare(i64),

    #[error("malformed device tree: {0}")]
    Fdt(String),

    #[error("too many chosen overrides (max {0})")]
    TooManyOverrides(usize),

    // Session errors
    #[error("not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("session handed off to the booted kernel; no further remote operations")]
    SessionHandedOff,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote operation {opcode:#x} failed with status {status}")]
    Remote { opcode: u64, status: i64 },

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("malformed boot args: {0}")]
    BootArgs(String),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("feature not supported: {0}")]
    NotSupported(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::InvalidState`] from two displayable states.
    pub fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        Error::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether the error came from the link rather than the target.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Checksum { .. } | Error::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"));
        assert!(io.is_transport());
        assert!(Error::Checksum { expected: 1, actual: 2 }.is_transport());
        assert!(!Error::OutOfMemory { size: 16 }.is_transport());
        assert!(!Error::SessionHandedOff.is_transport());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = Error::invalid_state("prepared", "unpatched");
        assert_eq!(
            err.to_string(),
            "not in expected state: expected prepared, got unpatched"
        );
    }
}
