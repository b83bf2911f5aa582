//! Host-side proxy client over a byte transport.
//!
//! This speaks the framed request/reply protocol described in the
//! [module docs](super) to the stub on the other end of a [`Transport`].

use std::io::{self, Read, Write};
use std::time::Duration;

use super::protocol::{
    checksum, opcode, status, FrameType, ProxyCall, ProxyResult, Reply, ReplyPayload, Request,
    REPLY_SIZE,
};
use super::Proxy;
use crate::boot::devtree::MAX_CHOSEN_PARAMS;
use crate::console;
use crate::error::{Error, Result};
use crate::transport::Transport;

const LOG: &str = "proxyboot::proxy";

/// Proxy client speaking to the stub over `T`.
pub struct UartProxy<T: Transport> {
    /// The byte link.
    link: T,
    /// Statistics: request frames sent.
    requests: u64,
    /// Statistics: bulk bytes written to the target.
    bytes_written: u64,
    /// Statistics: bulk bytes read from the target.
    bytes_read: u64,
}

impl<T: Transport> UartProxy<T> {
    /// Wrap a transport without talking to the target.
    pub fn new(link: T) -> Self {
        Self {
            link,
            requests: 0,
            bytes_written: 0,
            bytes_read: 0,
        }
    }

    /// Wrap a transport and check that a stub answers.
    pub fn connect(link: T) -> Result<Self> {
        let mut proxy = Self::new(link);
        proxy.nop()?;
        Ok(proxy)
    }

    /// Round-trip a NOP frame.
    pub fn nop(&mut self) -> Result<()> {
        self.send(&Request::Nop)?;
        self.recv_reply(FrameType::Nop)?;
        Ok(())
    }

    /// Issue a proxy call and return its result value.
    ///
    /// A non-zero call status becomes [`Error::Remote`].
    pub fn call(&mut self, op: u64, args: &[u64]) -> Result<u64> {
        let result = self.call_raw(op, args)?;
        if result.status != 0 {
            return Err(Error::Remote {
                opcode: op,
                status: result.status,
            });
        }
        Ok(result.retval)
    }

    fn call_raw(&mut self, op: u64, args: &[u64]) -> Result<ProxyResult> {
        let call = ProxyCall::new(op, args)?;
        log::debug!(target: LOG, "call {:#x} args {:x?}", op, args);

        self.send(&Request::Proxy(call))?;
        let reply = self.recv_reply(FrameType::Proxy)?;

        match reply.payload {
            ReplyPayload::Proxy(result) if result.opcode == op => {
                log::debug!(
                    target: LOG,
                    "reply {:#x} status {} retval {:#x}",
                    op,
                    result.status,
                    result.retval
                );
                Ok(result)
            }
            ReplyPayload::Proxy(result) => Err(Error::Protocol(format!(
                "reply for opcode {:#x} while waiting for {:#x}",
                result.opcode, op
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected payload {:?} for opcode {:#x}",
                other, op
            ))),
        }
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        self.link.write_all(&request.encode())?;
        self.requests += 1;
        Ok(())
    }

    fn recv_reply(&mut self, expected: FrameType) -> Result<Reply> {
        let mut frame = [0u8; REPLY_SIZE];
        self.link.read_exact(&mut frame)?;
        let reply = Reply::decode(&frame)?;

        if reply.frame_type != expected {
            return Err(Error::Protocol(format!(
                "got {:?} reply while waiting for {:?}",
                reply.frame_type, expected
            )));
        }

        match reply.status {
            status::OK => Ok(reply),
            status::CSUMERR => Err(Error::Protocol(format!(
                "target reported a checksum error on a {:?} frame",
                expected
            ))),
            other => Err(Error::Protocol(format!(
                "target rejected {:?} frame with status {}",
                expected, other
            ))),
        }
    }

    /// Stage a NUL-terminated string in a temporary heap buffer.
    fn stage_string(&mut self, s: &str) -> Result<u64> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);

        let size = bytes.len() as u64;
        let addr = self.malloc(size)?;
        if addr == 0 {
            return Err(Error::OutOfMemory { size });
        }
        self.write_memory(addr, &bytes)?;
        Ok(addr)
    }

    /// Run the console passthrough against explicit input and output.
    pub fn passthrough_with<R, W>(&mut self, input: R, output: W) -> Result<()>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        console::passthrough(&mut self.link, input, output)
    }

    /// Statistics: (requests, bytes written, bytes read).
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.requests, self.bytes_written, self.bytes_read)
    }

    /// Borrow the underlying transport.
    pub fn link(&self) -> &T {
        &self.link
    }

    /// Give back the underlying transport.
    pub fn into_inner(self) -> T {
        self.link
    }
}

impl<T: Transport> Proxy for UartProxy<T> {
    fn read32(&mut self, addr: u64) -> Result<u32> {
        Ok(self.call(opcode::READ32, &[addr])? as u32)
    }

    fn write32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.call(opcode::WRITE32, &[addr, u64::from(value)])?;
        Ok(())
    }

    fn malloc(&mut self, size: u64) -> Result<u64> {
        self.call(opcode::MALLOC, &[size])
    }

    fn memalign(&mut self, align: u64, size: u64) -> Result<u64> {
        self.call(opcode::MEMALIGN, &[align, size])
    }

    fn top_of_memory_alloc(&mut self, size: u64) -> Result<u64> {
        self.call(opcode::TOP_OF_MEMORY_ALLOC, &[size])
    }

    fn free(&mut self, addr: u64) -> Result<()> {
        self.call(opcode::FREE, &[addr])?;
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let expected = checksum(data);
        log::debug!(target: LOG, "memwrite {:#x} bytes to {:#x}", data.len(), addr);

        self.send(&Request::MemWrite {
            addr,
            size: data.len() as u64,
            data_checksum: expected,
        })?;
        self.link.write_all(data)?;
        self.link.flush()?;

        let reply = self.recv_reply(FrameType::MemWrite)?;
        match reply.payload {
            ReplyPayload::Memory { data_checksum } if data_checksum == expected => {
                self.bytes_written += data.len() as u64;
                Ok(())
            }
            ReplyPayload::Memory { data_checksum } => Err(Error::Checksum {
                expected,
                actual: data_checksum,
            }),
            other => Err(Error::Protocol(format!("unexpected memwrite payload {:?}", other))),
        }
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        log::debug!(target: LOG, "memread {:#x} bytes from {:#x}", len, addr);
        self.send(&Request::MemRead {
            addr,
            size: len as u64,
        })?;
        let reply = self.recv_reply(FrameType::MemRead)?;

        let mut data = vec![0u8; len];
        self.link.read_exact(&mut data)?;

        match reply.payload {
            ReplyPayload::Memory { data_checksum } => {
                let actual = checksum(&data);
                if actual != data_checksum {
                    return Err(Error::Checksum {
                        expected: data_checksum,
                        actual,
                    });
                }
            }
            other => {
                return Err(Error::Protocol(format!("unexpected memread payload {:?}", other)))
            }
        }

        self.bytes_read += len as u64;
        Ok(data)
    }

    fn kboot_set_chosen(&mut self, key: &str, value: &str) -> Result<()> {
        let key_addr = self.stage_string(key)?;
        let value_addr = self.stage_string(value)?;

        let result = self.call_raw(opcode::KBOOT_SET_CHOSEN, &[key_addr, value_addr])?;

        // The stub copies both strings before returning.
        self.free(value_addr)?;
        self.free(key_addr)?;

        if result.status != 0 {
            return Err(Error::Remote {
                opcode: opcode::KBOOT_SET_CHOSEN,
                status: result.status,
            });
        }
        if (result.retval as i64) < 0 {
            return Err(Error::TooManyOverrides(MAX_CHOSEN_PARAMS));
        }
        Ok(())
    }

    fn kboot_set_initrd(&mut self, addr: u64, size: u64) -> Result<()> {
        self.call(opcode::KBOOT_SET_INITRD, &[addr, size])?;
        Ok(())
    }

    fn kboot_prepare_dt(&mut self, dtb_addr: u64) -> Result<i64> {
        Ok(self.call(opcode::KBOOT_PREPARE_DT, &[dtb_addr])? as i64)
    }

    fn kboot_get_dt(&mut self) -> Result<u64> {
        self.call(opcode::KBOOT_GET_DT, &[])
    }

    fn kboot_boot(&mut self, addr: u64) -> Result<()> {
        self.call(opcode::KBOOT_BOOT, &[addr])?;
        Ok(())
    }

    fn get_bootargs(&mut self) -> Result<u64> {
        self.call(opcode::GET_BOOTARGS, &[])
    }

    fn get_base(&mut self) -> Result<u64> {
        self.call(opcode::GET_BASE, &[])
    }

    fn timeout(&self) -> Duration {
        self.link.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.link.set_timeout(timeout)?;
        Ok(())
    }

    fn ttymode(&mut self) -> Result<()> {
        let guard = console::RawTerminal::enable();
        let result = self.passthrough_with(io::stdin(), io::stdout());
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimLink, SimTarget};

    fn proxy() -> UartProxy<SimLink> {
        UartProxy::connect(SimLink::new(SimTarget::new())).unwrap()
    }

    #[test]
    fn test_register_roundtrip() {
        let mut p = proxy();
        let addr = p.malloc(16).unwrap();
        p.write32(addr, 0xCAFE_F00D).unwrap();
        assert_eq!(p.read32(addr).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn test_memory_roundtrip() {
        let mut p = proxy();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
        let addr = p.memalign(0x1000, data.len() as u64).unwrap();
        p.write_memory(addr, &data).unwrap();
        assert_eq!(p.read_memory(addr, data.len()).unwrap(), data);

        let (requests, written, read) = p.stats();
        assert!(requests >= 4);
        assert_eq!(written, 4096);
        assert_eq!(read, 4096);
    }

    #[test]
    fn test_set_chosen_frees_staging_buffers() {
        let mut p = proxy();
        p.kboot_set_chosen("bootargs", "console=ttyS0").unwrap();

        let link = p.into_inner();
        let target = link.target();
        assert_eq!(target.chosen("bootargs"), Some("console=ttyS0".to_string()));
        assert_eq!(target.live_allocations(), 0);
    }

    #[test]
    fn test_unknown_free_is_remote_error() {
        let mut p = proxy();
        let err = p.free(0xdead_0000).unwrap_err();
        assert!(matches!(err, Error::Remote { opcode: opcode::FREE, .. }));
    }

    #[test]
    fn test_corrupted_memwrite_detected() {
        let mut link = SimLink::new(SimTarget::new());
        link.corrupt_next_bulk_write();
        let mut p = UartProxy::connect(link).unwrap();
        let addr = p.malloc(64).unwrap();
        let err = p.write_memory(addr, &[0x55; 64]).unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
    }

    #[test]
    fn test_calls_rejected_after_boot() {
        let mut p = proxy();
        let kernel = p.memalign(0x20_0000, 0x1000).unwrap();
        p.kboot_boot(kernel).unwrap();
        assert!(p.malloc(16).is_err());
    }
}
