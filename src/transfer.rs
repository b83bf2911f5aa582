//! Bulk payload transfers into and out of target memory.
//!
//! A kernel image at serial speeds takes far longer than a single reply is
//! allowed to take, so the channel widens the link timeout for the duration
//! of a large transfer and puts it back afterwards.

use std::borrow::Cow;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::memory::MemoryRegion;
use crate::proxy::Proxy;

const LOG: &str = "proxyboot::transfer";

/// Fixed allowance on top of the wire time of a transfer.
const SLACK: Duration = Duration::from_secs(2);

/// Check a computed payload length.
///
/// Lengths come out of image decoding as signed values; zero or negative
/// means the image could not be decoded and nothing may be sent.
pub fn validate_length(len: i64) -> Result<u64> {
    if len <= 0 {
        return Err(Error::InvalidTransferSize(len));
    }
    Ok(len as u64)
}

/// How long to allow for moving `len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Link throughput in bytes per second.
    pub throughput: u64,
    /// Never go above this.
    pub ceiling: Duration,
}

impl TimeoutPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            throughput: config.throughput(),
            ceiling: config.max_transfer_timeout,
        }
    }

    /// Timeout for a transfer of `len` bytes, never below `default`.
    pub fn timeout_for(&self, len: u64, default: Duration) -> Duration {
        let nanos = u128::from(len) * 1_000_000_000 / u128::from(self.throughput.max(1));
        let wire = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        let wanted = (wire + SLACK).min(self.ceiling);
        wanted.max(default)
    }
}

/// A binary image bound to the region it will be written to.
#[derive(Debug, Clone)]
pub struct Payload<'a> {
    bytes: Cow<'a, [u8]>,
    destination: MemoryRegion,
}

impl<'a> Payload<'a> {
    /// Bind `bytes` to `destination`, which must be large enough.
    pub fn new(bytes: impl Into<Cow<'a, [u8]>>, destination: MemoryRegion) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() as u64 > destination.size {
            log::debug!(
                target: LOG,
                "{:#x} bytes do not fit in {}",
                bytes.len(),
                destination
            );
            return Err(Error::InvalidTransferSize(bytes.len() as i64));
        }
        Ok(Self { bytes, destination })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn destination(&self) -> &MemoryRegion {
        &self.destination
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Reads and writes target memory with size-scaled timeouts.
pub struct TransferChannel<'a, P: ?Sized> {
    proxy: &'a mut P,
    policy: TimeoutPolicy,
}

impl<'a, P: Proxy + ?Sized> TransferChannel<'a, P> {
    pub fn new(proxy: &'a mut P, policy: TimeoutPolicy) -> Self {
        Self { proxy, policy }
    }

    /// Write `bytes` at `address`. The write either completes or fails as a
    /// whole.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        validate_length(bytes.len() as i64)?;
        log::debug!(target: LOG, "write {:#x} bytes to {:#x}", bytes.len(), address);
        self.scaled(bytes.len() as u64, |proxy| proxy.write_memory(address, bytes))
    }

    /// Write a payload to its destination.
    pub fn write_payload(&mut self, payload: &Payload<'_>) -> Result<()> {
        self.write(payload.destination().address, payload.bytes())
    }

    /// Read `len` bytes from `address`.
    pub fn read(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        validate_length(len as i64)?;
        log::debug!(target: LOG, "read {:#x} bytes from {:#x}", len, address);
        let data = self.scaled(len as u64, |proxy| proxy.read_memory(address, len))?;
        if data.len() != len {
            return Err(Error::Protocol(format!(
                "asked for {} bytes from {:#x}, got {}",
                len,
                address,
                data.len()
            )));
        }
        Ok(data)
    }

    // Run `op` with the link timeout raised to cover `len` bytes, then put the
    // previous timeout back. The operation's error wins over a restore error.
    fn scaled<T>(&mut self, len: u64, op: impl FnOnce(&mut P) -> Result<T>) -> Result<T> {
        let default = self.proxy.timeout();
        let wanted = self.policy.timeout_for(len, default);
        if wanted == default {
            return op(&mut *self.proxy);
        }

        log::debug!(
            target: LOG,
            "raising timeout {:?} -> {:?} for {:#x} bytes",
            default,
            wanted,
            len
        );
        self.proxy.set_timeout(wanted)?;
        let result = op(&mut *self.proxy);
        let restored = self.proxy.set_timeout(default);
        let value = result?;
        restored?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;

    fn policy(throughput: u64) -> TimeoutPolicy {
        TimeoutPolicy {
            throughput,
            ceiling: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_validate_length() {
        assert_eq!(validate_length(1).unwrap(), 1);
        assert!(matches!(validate_length(0), Err(Error::InvalidTransferSize(0))));
        assert!(matches!(validate_length(-5), Err(Error::InvalidTransferSize(-5))));
    }

    #[test]
    fn test_timeout_scaling() {
        let default = Duration::from_secs(3);
        let p = policy(11_520);

        // Small transfers keep the default.
        assert_eq!(p.timeout_for(64, default), default);
        // 5 MiB at 11.5 KB/s is about 455 s of wire time.
        let t = p.timeout_for(5 * 1024 * 1024, default);
        assert!(t > Duration::from_secs(455) && t < Duration::from_secs(460));
        // Capped.
        assert_eq!(p.timeout_for(u64::MAX / 2, default), Duration::from_secs(600));
    }

    #[test]
    fn test_timeout_restored_after_transfer() {
        let mut target = SimTarget::new();
        let addr = target.memalign(0x20_0000, 0x10_0000).unwrap();
        let before = target.timeout();

        let mut channel = TransferChannel::new(&mut target, policy(1000));
        channel.write(addr, &vec![0xa5; 0x10_0000]).unwrap();
        assert_eq!(channel.read(addr, 16).unwrap(), vec![0xa5; 16]);

        assert_eq!(target.timeout(), before);
    }

    #[test]
    fn test_empty_write_rejected() {
        let mut target = SimTarget::new();
        let mut channel = TransferChannel::new(&mut target, policy(1000));
        assert!(matches!(
            channel.write(0x4100_0000, &[]),
            Err(Error::InvalidTransferSize(0))
        ));
        assert_eq!(target.memory_writes(), 0);
    }

    #[test]
    fn test_payload_must_fit() {
        let mut target = SimTarget::new();
        let addr = target.malloc(4).unwrap();
        let region = MemoryRegion::new(addr, 4);

        assert!(matches!(
            Payload::new(vec![0; 5], region),
            Err(Error::InvalidTransferSize(5))
        ));
        assert_eq!(target.memory_writes(), 0);

        let image = [1u8, 2, 3];
        let payload = Payload::new(&image[..], region).unwrap();
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.destination().address, addr);

        let mut channel = TransferChannel::new(&mut target, policy(1000));
        channel.write_payload(&payload).unwrap();
        assert_eq!(target.peek(addr, 3).unwrap(), image);
    }
}
