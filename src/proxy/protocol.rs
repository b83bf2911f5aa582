//! Proxy wire protocol definitions.
//!
//! All integers are little-endian. Every frame ends with a checksum over the
//! bytes before it, and bulk memory data carries its own checksum inside the
//! frame that announces it.

use crate::error::{Error, Result};

/// Size of an encoded request frame.
pub const REQUEST_SIZE: usize = 64;

/// Size of an encoded reply frame.
pub const REPLY_SIZE: usize = 36;

/// Number of argument words in a proxy call.
pub const PROXY_ARGS: usize = 6;

const CHECKSUM_START: u32 = 0xDEAD_BEEF;
const CHECKSUM_FINISH: u32 = 0xADDE_DBAD;

/// Frame types. The low byte is the command, the upper bytes a sync pattern.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Nop = 0x00AA_55FF,
    Proxy = 0x01AA_55FF,
    MemRead = 0x02AA_55FF,
    MemWrite = 0x03AA_55FF,
}

impl FrameType {
    fn from_u32(value: u32) -> Result<Self> {
        match value {
            0x00AA_55FF => Ok(FrameType::Nop),
            0x01AA_55FF => Ok(FrameType::Proxy),
            0x02AA_55FF => Ok(FrameType::MemRead),
            0x03AA_55FF => Ok(FrameType::MemWrite),
            other => Err(Error::Protocol(format!("unknown frame type {:#010x}", other))),
        }
    }
}

/// Frame-level reply status codes.
pub mod status {
    pub const OK: i32 = 0;
    pub const BADCMD: i32 = -1;
    pub const INVAL: i32 = -2;
    pub const XFRERR: i32 = -3;
    pub const CSUMERR: i32 = -4;
}

/// Proxy opcodes understood by the stub.
#[allow(dead_code)]
pub mod opcode {
    pub const NOP: u64 = 0x000;
    pub const EXIT: u64 = 0x001;
    pub const CALL: u64 = 0x002;
    pub const GET_BOOTARGS: u64 = 0x003;
    pub const GET_BASE: u64 = 0x004;
    pub const SET_BAUD: u64 = 0x005;
    pub const UDELAY: u64 = 0x006;

    pub const WRITE64: u64 = 0x100;
    pub const WRITE32: u64 = 0x101;
    pub const WRITE16: u64 = 0x102;
    pub const WRITE8: u64 = 0x103;
    pub const READ64: u64 = 0x104;
    pub const READ32: u64 = 0x105;
    pub const READ16: u64 = 0x106;
    pub const READ8: u64 = 0x107;

    pub const HEAPBLOCK_ALLOC: u64 = 0x600;
    pub const MALLOC: u64 = 0x601;
    pub const TOP_OF_MEMORY_ALLOC: u64 = 0x602;
    pub const MEMALIGN: u64 = 0x603;
    pub const FREE: u64 = 0x604;

    pub const KBOOT_BOOT: u64 = 0x700;
    pub const KBOOT_SET_CHOSEN: u64 = 0x701;
    pub const KBOOT_SET_INITRD: u64 = 0x702;
    pub const KBOOT_PREPARE_DT: u64 = 0x703;
    pub const KBOOT_GET_DT: u64 = 0x704;
}

/// Running checksum used by frames and memory payloads.
#[derive(Debug, Clone, Copy)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Self {
        Checksum(CHECKSUM_START)
    }

    pub fn update(mut self, data: &[u8]) -> Self {
        for &byte in data {
            self.0 = self.0.wrapping_mul(31).wrapping_add(u32::from(byte));
        }
        self
    }

    pub fn finish(self) -> u32 {
        self.0 ^ CHECKSUM_FINISH
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a complete buffer.
pub fn checksum(data: &[u8]) -> u32 {
    Checksum::new().update(data).finish()
}

fn verify_trailer(frame: &[u8]) -> Result<()> {
    let body = frame.len() - 4;
    let expected = read_u32(frame, body);
    let actual = checksum(&frame[..body]);
    if expected != actual {
        return Err(Error::Checksum { expected, actual });
    }
    Ok(())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(word)
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// A remote procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyCall {
    pub opcode: u64,
    pub args: [u64; PROXY_ARGS],
}

impl ProxyCall {
    /// Build a call, zero-filling unused arguments.
    pub fn new(opcode: u64, args: &[u64]) -> Result<Self> {
        if args.len() > PROXY_ARGS {
            return Err(Error::Protocol(format!(
                "opcode {:#x} takes at most {} arguments, got {}",
                opcode,
                PROXY_ARGS,
                args.len()
            )));
        }
        let mut padded = [0u64; PROXY_ARGS];
        padded[..args.len()].copy_from_slice(args);
        Ok(Self {
            opcode,
            args: padded,
        })
    }
}

/// A request frame sent host → target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Nop,
    Proxy(ProxyCall),
    MemRead { addr: u64, size: u64 },
    MemWrite { addr: u64, size: u64, data_checksum: u32 },
}

impl Request {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Request::Nop => FrameType::Nop,
            Request::Proxy(_) => FrameType::Proxy,
            Request::MemRead { .. } => FrameType::MemRead,
            Request::MemWrite { .. } => FrameType::MemWrite,
        }
    }

    /// Encode the request to a fixed-size frame.
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        put_u32(&mut buf, 0, self.frame_type() as u32);

        match *self {
            Request::Nop => {}
            Request::Proxy(call) => {
                put_u64(&mut buf, 4, call.opcode);
                for (i, arg) in call.args.iter().enumerate() {
                    put_u64(&mut buf, 12 + i * 8, *arg);
                }
            }
            Request::MemRead { addr, size } => {
                put_u64(&mut buf, 4, addr);
                put_u64(&mut buf, 12, size);
            }
            Request::MemWrite {
                addr,
                size,
                data_checksum,
            } => {
                put_u64(&mut buf, 4, addr);
                put_u64(&mut buf, 12, size);
                put_u32(&mut buf, 20, data_checksum);
            }
        }

        let sum = checksum(&buf[..REQUEST_SIZE - 4]);
        put_u32(&mut buf, REQUEST_SIZE - 4, sum);
        buf
    }

    /// Decode a request frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != REQUEST_SIZE {
            return Err(Error::Protocol(format!(
                "request frame is {} bytes, expected {}",
                buf.len(),
                REQUEST_SIZE
            )));
        }
        verify_trailer(buf)?;

        let request = match FrameType::from_u32(read_u32(buf, 0))? {
            FrameType::Nop => Request::Nop,
            FrameType::Proxy => {
                let mut args = [0u64; PROXY_ARGS];
                for (i, arg) in args.iter_mut().enumerate() {
                    *arg = read_u64(buf, 12 + i * 8);
                }
                Request::Proxy(ProxyCall {
                    opcode: read_u64(buf, 4),
                    args,
                })
            }
            FrameType::MemRead => Request::MemRead {
                addr: read_u64(buf, 4),
                size: read_u64(buf, 12),
            },
            FrameType::MemWrite => Request::MemWrite {
                addr: read_u64(buf, 4),
                size: read_u64(buf, 12),
                data_checksum: read_u32(buf, 20),
            },
        };
        Ok(request)
    }
}

/// Result of a remote procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyResult {
    pub opcode: u64,
    pub status: i64,
    pub retval: u64,
}

/// Payload of a reply frame, shaped by the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPayload {
    Empty,
    Proxy(ProxyResult),
    Memory { data_checksum: u32 },
}

/// A reply frame sent target → host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub frame_type: FrameType,
    pub status: i32,
    pub payload: ReplyPayload,
}

impl Reply {
    pub fn ok(frame_type: FrameType, payload: ReplyPayload) -> Self {
        Self {
            frame_type,
            status: status::OK,
            payload,
        }
    }

    pub fn error(frame_type: FrameType, status: i32) -> Self {
        Self {
            frame_type,
            status,
            payload: ReplyPayload::Empty,
        }
    }

    /// Encode the reply to a fixed-size frame.
    pub fn encode(&self) -> [u8; REPLY_SIZE] {
        let mut buf = [0u8; REPLY_SIZE];
        put_u32(&mut buf, 0, self.frame_type as u32);
        put_u32(&mut buf, 4, self.status as u32);

        match self.payload {
            ReplyPayload::Empty => {}
            ReplyPayload::Proxy(result) => {
                put_u64(&mut buf, 8, result.opcode);
                put_u64(&mut buf, 16, result.status as u64);
                put_u64(&mut buf, 24, result.retval);
            }
            ReplyPayload::Memory { data_checksum } => {
                put_u32(&mut buf, 8, data_checksum);
            }
        }

        let sum = checksum(&buf[..REPLY_SIZE - 4]);
        put_u32(&mut buf, REPLY_SIZE - 4, sum);
        buf
    }

    /// Decode a reply frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != REPLY_SIZE {
            return Err(Error::Protocol(format!(
                "reply frame is {} bytes, expected {}",
                buf.len(),
                REPLY_SIZE
            )));
        }
        verify_trailer(buf)?;

        let frame_type = FrameType::from_u32(read_u32(buf, 0))?;
        let status = read_u32(buf, 4) as i32;

        let payload = match frame_type {
            FrameType::Nop => ReplyPayload::Empty,
            FrameType::Proxy => ReplyPayload::Proxy(ProxyResult {
                opcode: read_u64(buf, 8),
                status: read_u64(buf, 16) as i64,
                retval: read_u64(buf, 24),
            }),
            FrameType::MemRead | FrameType::MemWrite => ReplyPayload::Memory {
                data_checksum: read_u32(buf, 8),
            },
        };

        Ok(Self {
            frame_type,
            status,
            payload,
        })
    }
}
