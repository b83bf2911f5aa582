//! Wire-level front end for [`SimTarget`].

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::SimTarget;
use crate::error::{Error, Result};
use crate::proxy::protocol::{
    checksum, opcode, status, FrameType, ProxyCall, ProxyResult, Reply, ReplyPayload, Request,
    REQUEST_SIZE,
};
use crate::proxy::Proxy;
use crate::transport::Transport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bytes in flight between host and stub.
#[derive(Debug, Default)]
struct Wire {
    /// Host bytes not yet consumed by the stub.
    rx: Vec<u8>,
    /// Stub bytes not yet read by the host.
    tx: VecDeque<u8>,
    /// Bulk write announced by a MEMWRITE frame: (address, size).
    pending_write: Option<(u64, usize)>,
    corrupt_next: bool,
}

/// A [`Transport`] whose far end is a [`SimTarget`] running the stub.
///
/// Clones share the same target and wire, like clones of a serial fd.
#[derive(Clone)]
pub struct SimLink {
    target: Arc<Mutex<SimTarget>>,
    wire: Arc<Mutex<Wire>>,
    timeout: Duration,
}

impl SimLink {
    pub fn new(target: SimTarget) -> Self {
        Self {
            target: Arc::new(Mutex::new(target)),
            wire: Arc::new(Mutex::new(Wire::default())),
            timeout: Duration::from_secs(3),
        }
    }

    /// Lock the simulated target for inspection.
    pub fn target(&self) -> MutexGuard<'_, SimTarget> {
        lock(&self.target)
    }

    /// Flip a bit in the payload of the next bulk write, as line noise would.
    pub fn corrupt_next_bulk_write(&mut self) {
        lock(&self.wire).corrupt_next = true;
    }

    fn pump(wire: &mut Wire, target: &mut SimTarget) {
        loop {
            if let Some((addr, size)) = wire.pending_write {
                if wire.rx.len() < size {
                    return;
                }
                let mut data: Vec<u8> = wire.rx.drain(..size).collect();
                if std::mem::take(&mut wire.corrupt_next) {
                    if let Some(first) = data.first_mut() {
                        *first ^= 0x01;
                    }
                }
                let reply = match target.write_memory(addr, &data) {
                    Ok(()) => Reply::ok(
                        FrameType::MemWrite,
                        ReplyPayload::Memory {
                            data_checksum: checksum(&data),
                        },
                    ),
                    Err(_) => Reply::error(FrameType::MemWrite, status::XFRERR),
                };
                wire.tx.extend(reply.encode());
                wire.pending_write = None;
                continue;
            }

            // Once the kernel runs, whatever the host sends is console input.
            if target.booted().is_some() {
                let typed: Vec<u8> = wire.rx.drain(..).collect();
                target.push_console_input(&typed);
                return;
            }

            if wire.rx.len() < REQUEST_SIZE {
                return;
            }
            let frame: Vec<u8> = wire.rx.drain(..REQUEST_SIZE).collect();

            let request = match Request::decode(&frame) {
                Ok(request) => request,
                Err(Error::Checksum { .. }) => {
                    wire.tx
                        .extend(Reply::error(frame_type_of(&frame), status::CSUMERR).encode());
                    continue;
                }
                Err(_) => {
                    wire.tx
                        .extend(Reply::error(FrameType::Nop, status::BADCMD).encode());
                    continue;
                }
            };

            match request {
                Request::Nop => {
                    wire.tx
                        .extend(Reply::ok(FrameType::Nop, ReplyPayload::Empty).encode());
                }
                Request::Proxy(call) => {
                    let result = dispatch(target, call);
                    wire.tx
                        .extend(Reply::ok(FrameType::Proxy, ReplyPayload::Proxy(result)).encode());
                }
                Request::MemRead { addr, size } => {
                    let data = usize::try_from(size)
                        .ok()
                        .filter(|&len| len as u64 <= target.ram_size())
                        .and_then(|len| target.read_memory(addr, len).ok());
                    match data {
                        Some(data) => {
                            let reply = Reply::ok(
                                FrameType::MemRead,
                                ReplyPayload::Memory {
                                    data_checksum: checksum(&data),
                                },
                            );
                            wire.tx.extend(reply.encode());
                            wire.tx.extend(data);
                        }
                        None => wire
                            .tx
                            .extend(Reply::error(FrameType::MemRead, status::XFRERR).encode()),
                    }
                }
                Request::MemWrite { addr, size, .. } => match usize::try_from(size) {
                    Ok(size) if size as u64 <= target.ram_size() => {
                        wire.pending_write = Some((addr, size));
                    }
                    _ => wire
                        .tx
                        .extend(Reply::error(FrameType::MemWrite, status::XFRERR).encode()),
                },
            }
        }
    }
}

/// Best-effort frame type for replying to a frame that failed its checksum.
fn frame_type_of(frame: &[u8]) -> FrameType {
    let raw = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    [
        FrameType::Nop,
        FrameType::Proxy,
        FrameType::MemRead,
        FrameType::MemWrite,
    ]
    .into_iter()
    .find(|t| *t as u32 == raw)
    .unwrap_or(FrameType::Nop)
}

fn dispatch(target: &mut SimTarget, call: ProxyCall) -> ProxyResult {
    let a = call.args;
    let outcome: Result<u64> = match call.opcode {
        opcode::NOP => Ok(0),
        opcode::GET_BOOTARGS => target.get_bootargs(),
        opcode::GET_BASE => target.get_base(),
        opcode::READ32 => target.read32(a[0]).map(u64::from),
        opcode::WRITE32 => target.write32(a[0], a[1] as u32).map(|_| 0),
        opcode::MALLOC => target.malloc(a[0]),
        opcode::MEMALIGN => target.memalign(a[0], a[1]),
        opcode::TOP_OF_MEMORY_ALLOC => target.top_of_memory_alloc(a[0]),
        opcode::FREE => target.free(a[0]).map(|_| 0),
        opcode::KBOOT_SET_CHOSEN => set_chosen(target, a[0], a[1]),
        opcode::KBOOT_SET_INITRD => target.kboot_set_initrd(a[0], a[1]).map(|_| 0),
        opcode::KBOOT_PREPARE_DT => target.kboot_prepare_dt(a[0]).map(|s| s as u64),
        opcode::KBOOT_GET_DT => target.kboot_get_dt(),
        opcode::KBOOT_BOOT => target.kboot_boot(a[0]).map(|_| 0),
        other => Err(Error::Remote {
            opcode: other,
            status: i64::from(status::BADCMD),
        }),
    };

    let (code, retval) = match outcome {
        Ok(retval) => (0, retval),
        Err(Error::Remote { status: code, .. }) => (code, 0),
        Err(_) => (i64::from(status::INVAL), 0),
    };
    ProxyResult {
        opcode: call.opcode,
        status: code,
        retval,
    }
}

// The stub reports a full chosen table through a negative return value.
fn set_chosen(target: &mut SimTarget, key_addr: u64, value_addr: u64) -> Result<u64> {
    let key = target.read_cstr(key_addr)?;
    let value = target.read_cstr(value_addr)?;
    match target.kboot_set_chosen(&key, &value) {
        Err(Error::TooManyOverrides(_)) => Ok(-1i64 as u64),
        other => other.map(|_| 0),
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut wire = lock(&self.wire);
        if !wire.tx.is_empty() {
            let n = buf.len().min(wire.tx.len());
            for (slot, byte) in buf.iter_mut().zip(wire.tx.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }

        let mut target = lock(&self.target);
        if target.booted().is_some() {
            // Zero once the scripted console output runs dry.
            return Ok(target.take_console_output(buf));
        }

        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "simulated target has nothing to send",
        ))
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = lock(&self.wire);
        let mut target = lock(&self.target);
        wire.rx.extend_from_slice(buf);
        Self::pump(&mut wire, &mut target);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for SimLink {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::protocol::REPLY_SIZE;

    fn roundtrip(link: &mut SimLink, request: Request) -> Reply {
        link.write_all(&request.encode()).unwrap();
        let mut frame = [0u8; REPLY_SIZE];
        link.read_exact(&mut frame).unwrap();
        Reply::decode(&frame).unwrap()
    }

    #[test]
    fn test_nop() {
        let mut link = SimLink::new(SimTarget::new());
        let reply = roundtrip(&mut link, Request::Nop);
        assert_eq!(reply.frame_type, FrameType::Nop);
        assert_eq!(reply.status, status::OK);
    }

    #[test]
    fn test_bad_checksum_reported() {
        let mut link = SimLink::new(SimTarget::new());
        let mut frame = Request::Nop.encode();
        frame[REQUEST_SIZE - 1] ^= 0xff;
        link.write_all(&frame).unwrap();

        let mut reply = [0u8; REPLY_SIZE];
        link.read_exact(&mut reply).unwrap();
        let reply = Reply::decode(&reply).unwrap();
        assert_eq!(reply.frame_type, FrameType::Nop);
        assert_eq!(reply.status, status::CSUMERR);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut link = SimLink::new(SimTarget::new());
        let call = ProxyCall::new(0x0abc, &[]).unwrap();
        let reply = roundtrip(&mut link, Request::Proxy(call));
        match reply.payload {
            ReplyPayload::Proxy(result) => {
                assert_eq!(result.status, i64::from(status::BADCMD));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_split_bulk_write() {
        let mut link = SimLink::new(SimTarget::new());
        let addr = link.target().malloc(8).unwrap();
        let data = b"abcdefgh";

        link.write_all(
            &Request::MemWrite {
                addr,
                size: 8,
                data_checksum: checksum(data),
            }
            .encode(),
        )
        .unwrap();
        link.write_all(&data[..3]).unwrap();
        link.write_all(&data[3..]).unwrap();

        let mut reply = [0u8; REPLY_SIZE];
        link.read_exact(&mut reply).unwrap();
        assert_eq!(
            Reply::decode(&reply).unwrap().payload,
            ReplyPayload::Memory {
                data_checksum: checksum(data)
            }
        );
        assert_eq!(link.target().peek(addr, 8).unwrap(), data);
    }

    #[test]
    fn test_silent_link_times_out() {
        let mut link = SimLink::new(SimTarget::new());
        let mut byte = [0u8; 1];
        let err = link.read(&mut byte).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
