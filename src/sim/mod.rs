//! An in-memory stand-in for a target running the proxy stub.
//!
//! [`SimTarget`] implements [`Proxy`] directly, and [`SimLink`] puts the same
//! target behind a byte [`Transport`](crate::transport::Transport) that speaks
//! the wire protocol, so the UART client can be exercised end to end. The
//! binary uses it for `--dry-run`.
//!
//! The simulated machine has:
//! - RAM at `[ram_base, ram_base + ram_size)`. The heap grows up from
//!   [`HEAP_OFFSET`], top-of-memory allocations grow down from the end.
//! - The boot args record at [`BOOTARGS_OFFSET`] and the stub image at
//!   [`STUB_OFFSET`].
//! - A timer block at [`TIMER_BASE`] whose counter advances on every low-word
//!   read once enabled.
//! - A kboot implementation that patches the device tree with the staged
//!   `/chosen` properties, initrd location and memory node.

mod link;
mod memory;

pub use link::SimLink;
pub use memory::SparseMemory;

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};
use std::time::Duration;

use crate::boot::devtree::MAX_CHOSEN_PARAMS;
use crate::bootargs::BootArgs;
use crate::error::{Error, Result};
use crate::fdt::{self, Fdt, Node};
use crate::proxy::protocol::{opcode, status};
use crate::proxy::Proxy;
use crate::timer::{TIMER_BASE, TIMER_CTL, TIMER_ENABLE, TIMER_FREQ, TIMER_HI, TIMER_LO};

const LOG: &str = "proxyboot::proxy";

/// Default RAM base.
pub const SIM_RAM_BASE: u64 = 0x4000_0000;
/// Default RAM size.
pub const SIM_RAM_SIZE: u64 = 0x4000_0000;
/// Offset of the boot args record from the RAM base.
pub const BOOTARGS_OFFSET: u64 = 0x800;
/// Offset of the stub image from the RAM base.
pub const STUB_OFFSET: u64 = 0x4000;
/// Offset of the first heap byte from the RAM base.
pub const HEAP_OFFSET: u64 = 0x100_0000;

const PAGE_SIZE: u64 = 0x4000;
const HEAP_ALIGN: u64 = 16;
/// Slack left after a packed device tree for later in-place edits.
const DT_SLACK: u64 = 0x1_0000;
/// Longest string the stub will read for a chosen key or value.
const MAX_CSTR: usize = 4096;

fn align_up(value: u64, align: u64) -> Option<u64> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

fn remote(op: u64, status: i32) -> Error {
    Error::Remote {
        opcode: op,
        status: i64::from(status),
    }
}

/// The target's free-running counter.
#[derive(Debug)]
struct SimTimer {
    base: u64,
    counter: u64,
    ctl: u32,
    step: u64,
}

impl SimTimer {
    fn owns(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + 0x100
    }

    fn read(&mut self, addr: u64) -> u32 {
        match addr - self.base {
            TIMER_HI => (self.counter >> 32) as u32,
            TIMER_LO => {
                let lo = self.counter as u32;
                if self.ctl & TIMER_ENABLE != 0 {
                    self.counter = self.counter.wrapping_add(self.step);
                }
                lo
            }
            TIMER_CTL => self.ctl,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u64, value: u32) {
        if addr - self.base == TIMER_CTL {
            self.ctl = value;
        }
    }
}

/// A simulated target machine.
#[derive(Debug)]
pub struct SimTarget {
    ram: SparseMemory,
    ram_base: u64,
    ram_size: u64,
    heap_next: u64,
    top: u64,
    live: BTreeMap<u64, u64>,
    timer: SimTimer,
    chosen: Vec<(String, String)>,
    initrd: Option<(u64, u64)>,
    dt: Option<u64>,
    forced_prepare_status: Option<i64>,
    booted: Option<u64>,
    console_output: VecDeque<u8>,
    console_input: Vec<u8>,
    timeout: Duration,
    memory_writes: usize,
    memory_reads: usize,
}

impl SimTarget {
    /// A target with [`SIM_RAM_SIZE`] bytes of RAM at [`SIM_RAM_BASE`].
    pub fn new() -> Self {
        Self::with_ram(SIM_RAM_BASE, SIM_RAM_SIZE)
    }

    /// A target with a custom RAM window.
    pub fn with_ram(ram_base: u64, ram_size: u64) -> Self {
        let mut target = Self {
            ram: SparseMemory::new(),
            ram_base,
            ram_size,
            heap_next: ram_base + HEAP_OFFSET,
            top: ram_base + ram_size,
            live: BTreeMap::new(),
            timer: SimTimer {
                base: TIMER_BASE,
                counter: 0,
                ctl: 0,
                // 5us per counter read
                step: TIMER_FREQ / 1_000_000 * 5,
            },
            chosen: Vec::new(),
            initrd: None,
            dt: None,
            forced_prepare_status: None,
            booted: None,
            console_output: VecDeque::new(),
            console_input: Vec::new(),
            timeout: Duration::from_secs(3),
            memory_writes: 0,
            memory_reads: 0,
        };

        let args = BootArgs {
            revision: 1,
            version: 2,
            virt_base: 0,
            phys_base: u32::try_from(ram_base).unwrap_or(0),
            mem_size: u32::try_from(ram_size).unwrap_or(u32::MAX),
            top_of_kernel_data: u32::try_from(ram_base + HEAP_OFFSET).unwrap_or(0),
            video: Default::default(),
            machine_type: 0,
            devtree: 0,
            devtree_size: 0,
            cmdline: String::new(),
            boot_flags: 0,
        };
        target.ram.write(ram_base + BOOTARGS_OFFSET, &args.encode());
        target
    }

    /// Bytes the "kernel" prints once booted.
    pub fn set_console_output(&mut self, output: Vec<u8>) {
        self.console_output = output.into();
    }

    /// Bytes typed into the console after boot.
    pub fn console_input(&self) -> Vec<u8> {
        self.console_input.clone()
    }

    /// Make the next `kboot_prepare_dt` report `status` without patching.
    pub fn fail_next_prepare(&mut self, status: i64) {
        self.forced_prepare_status = Some(status);
    }

    /// Put the target in the booted state without going through the proxy.
    pub fn force_booted(&mut self, entry: u64) {
        self.booted = Some(entry);
    }

    /// Entry point the target jumped to, once booted.
    pub fn booted(&self) -> Option<u64> {
        self.booted
    }

    /// Value staged for a `/chosen` property.
    pub fn chosen(&self, key: &str) -> Option<String> {
        self.chosen
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Registered initrd `(address, size)`.
    pub fn initrd(&self) -> Option<(u64, u64)> {
        self.initrd
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Number of bulk memory writes served.
    pub fn memory_writes(&self) -> usize {
        self.memory_writes
    }

    /// Number of bulk memory reads served.
    pub fn memory_reads(&self) -> usize {
        self.memory_reads
    }

    pub fn ram_base(&self) -> u64 {
        self.ram_base
    }

    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Read RAM without going through the proxy.
    pub fn peek(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.check_ram(addr, len as u64)?;
        Ok(self.ram.read(addr, len))
    }

    pub(crate) fn take_console_output(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.console_output.len());
        for (slot, byte) in buf.iter_mut().zip(self.console_output.drain(..n)) {
            *slot = byte;
        }
        n
    }

    pub(crate) fn push_console_input(&mut self, data: &[u8]) {
        self.console_input.extend_from_slice(data);
    }

    /// Read a NUL-terminated string from RAM.
    pub(crate) fn read_cstr(&self, addr: u64) -> Result<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        while bytes.len() < MAX_CSTR {
            self.check_ram(cursor, 1)?;
            let byte = self.ram.read(cursor, 1)[0];
            if byte == 0 {
                return String::from_utf8(bytes)
                    .map_err(|_| Error::Protocol(format!("string at {:#x} is not UTF-8", addr)));
            }
            bytes.push(byte);
            cursor += 1;
        }
        Err(Error::Protocol(format!("unterminated string at {:#x}", addr)))
    }

    fn serving(&self) -> Result<()> {
        match self.booted {
            Some(entry) => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("target left the proxy for {:#x}", entry),
            ))),
            None => Ok(()),
        }
    }

    fn check_ram(&self, addr: u64, len: u64) -> Result<()> {
        let end = addr.checked_add(len);
        match end {
            Some(end) if addr >= self.ram_base && end <= self.ram_base + self.ram_size => Ok(()),
            _ => Err(Error::Protocol(format!(
                "access to {:#x}+{:#x} outside target RAM",
                addr, len
            ))),
        }
    }

    fn heap_alloc(&mut self, align: u64, size: u64) -> u64 {
        let size = size.max(1);
        let address = match align_up(self.heap_next, align) {
            Some(address) => address,
            None => return 0,
        };
        match address.checked_add(size) {
            Some(end) if end <= self.top => {
                self.heap_next = end;
                self.live.insert(address, size);
                address
            }
            _ => 0,
        }
    }

    fn patch_devtree(&mut self, dtb_addr: u64) -> Result<u64> {
        let header = self.peek(dtb_addr, 8)?;
        let size = fdt::total_size(&header)?;
        let blob = self.peek(dtb_addr, size as usize)?;
        let mut tree = Fdt::parse(&blob)?;

        let chosen = tree.root.child_or_insert("chosen");
        for (key, value) in &self.chosen {
            chosen.set_property_str(key, value);
        }
        if let Some((start, size)) = self.initrd {
            chosen.set_property_u64("linux,initrd-start", start);
            chosen.set_property_u64("linux,initrd-end", start + size);
            tree.reservations.push((start, size));
        }

        if tree.root.child("memory").is_none() {
            tree.root
                .children
                .push(Node::new(format!("memory@{:x}", self.ram_base)));
        }
        if let Some(memory) = tree.root.child_mut("memory") {
            memory.set_property_str("device_type", "memory");
            memory.set_reg64(self.ram_base, self.ram_size);
        }

        // The blob reserves its own location, which adds one map entry.
        let packed = tree.to_bytes()?.len() as u64 + 16;
        let buffer = align_up(packed + DT_SLACK, PAGE_SIZE)
            .ok_or_else(|| Error::Fdt("device tree too large".into()))?;
        let address = self.top_of_memory_alloc(buffer)?;
        if address == 0 {
            return Err(Error::OutOfMemory { size: buffer });
        }
        tree.reservations.push((address, buffer));

        let bytes = tree.to_bytes()?;
        self.ram.write(address, &bytes);
        log::debug!(
            target: LOG,
            "sim: packed {} byte device tree at {:#x}",
            bytes.len(),
            address
        );
        Ok(address)
    }
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl Proxy for SimTarget {
    fn read32(&mut self, addr: u64) -> Result<u32> {
        self.serving()?;
        if self.timer.owns(addr) {
            return Ok(self.timer.read(addr));
        }
        self.check_ram(addr, 4)
            .map_err(|_| remote(opcode::READ32, status::INVAL))?;
        let bytes = self.ram.read(addr, 4);
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.serving()?;
        if self.timer.owns(addr) {
            self.timer.write(addr, value);
            return Ok(());
        }
        self.check_ram(addr, 4)
            .map_err(|_| remote(opcode::WRITE32, status::INVAL))?;
        self.ram.write(addr, &value.to_le_bytes());
        Ok(())
    }

    fn malloc(&mut self, size: u64) -> Result<u64> {
        self.serving()?;
        Ok(self.heap_alloc(HEAP_ALIGN, size))
    }

    fn memalign(&mut self, align: u64, size: u64) -> Result<u64> {
        self.serving()?;
        if !align.is_power_of_two() {
            return Err(remote(opcode::MEMALIGN, status::INVAL));
        }
        Ok(self.heap_alloc(align.max(HEAP_ALIGN), size))
    }

    fn top_of_memory_alloc(&mut self, size: u64) -> Result<u64> {
        self.serving()?;
        let address = match self.top.checked_sub(size.max(1)) {
            Some(address) => address & !(PAGE_SIZE - 1),
            None => return Ok(0),
        };
        if address < self.heap_next {
            return Ok(0);
        }
        self.top = address;
        self.live.insert(address, size);
        Ok(address)
    }

    fn free(&mut self, addr: u64) -> Result<()> {
        self.serving()?;
        match self.live.remove(&addr) {
            Some(_) => Ok(()),
            None => Err(remote(opcode::FREE, status::INVAL)),
        }
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.serving()?;
        self.check_ram(addr, data.len() as u64)?;
        self.ram.write(addr, data);
        self.memory_writes += 1;
        Ok(())
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.serving()?;
        self.memory_reads += 1;
        self.peek(addr, len)
    }

    fn kboot_set_chosen(&mut self, key: &str, value: &str) -> Result<()> {
        self.serving()?;
        if let Some(slot) = self.chosen.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
            return Ok(());
        }
        if self.chosen.len() >= MAX_CHOSEN_PARAMS {
            return Err(Error::TooManyOverrides(MAX_CHOSEN_PARAMS));
        }
        self.chosen.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn kboot_set_initrd(&mut self, addr: u64, size: u64) -> Result<()> {
        self.serving()?;
        self.initrd = Some((addr, size));
        Ok(())
    }

    fn kboot_prepare_dt(&mut self, dtb_addr: u64) -> Result<i64> {
        self.serving()?;
        if let Some(status) = self.forced_prepare_status.take() {
            return Ok(status);
        }
        match self.patch_devtree(dtb_addr) {
            Ok(address) => {
                self.dt = Some(address);
                Ok(0)
            }
            Err(e) => {
                log::warn!(target: LOG, "sim: device tree prepare failed: {}", e);
                Ok(-1)
            }
        }
    }

    fn kboot_get_dt(&mut self) -> Result<u64> {
        self.serving()?;
        Ok(self.dt.unwrap_or(0))
    }

    fn kboot_boot(&mut self, addr: u64) -> Result<()> {
        self.serving()?;
        self.check_ram(addr, 4)
            .map_err(|_| remote(opcode::KBOOT_BOOT, status::INVAL))?;
        log::info!(target: LOG, "sim: jumping to {:#x}", addr);
        self.booted = Some(addr);
        Ok(())
    }

    fn get_bootargs(&mut self) -> Result<u64> {
        self.serving()?;
        Ok(self.ram_base + BOOTARGS_OFFSET)
    }

    fn get_base(&mut self) -> Result<u64> {
        self.serving()?;
        Ok(self.ram_base + STUB_OFFSET)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn ttymode(&mut self) -> Result<()> {
        if self.booted.is_none() {
            return Err(Error::invalid_state("booted", "serving proxy requests"));
        }
        let output: Vec<u8> = self.console_output.drain(..).collect();
        let mut stdout = io::stdout();
        stdout.write_all(&output)?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::FdtBuilder;

    fn minimal_dtb() -> Vec<u8> {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.property_u32("#address-cells", 2);
        b.property_u32("#size-cells", 2);
        b.end_node();
        b.finish().unwrap()
    }

    #[test]
    fn test_heap_and_top_do_not_meet() {
        let mut target = SimTarget::with_ram(0x4000_0000, HEAP_OFFSET + 0x8000);
        assert_ne!(target.malloc(0x4000).unwrap(), 0);
        assert_ne!(target.top_of_memory_alloc(0x4000).unwrap(), 0);
        assert_eq!(target.malloc(0x10).unwrap(), 0);
        assert_eq!(target.top_of_memory_alloc(0x10).unwrap(), 0);
    }

    #[test]
    fn test_timer_counts_once_enabled() {
        let mut target = SimTarget::new();
        let lo = TIMER_BASE + TIMER_LO;
        assert_eq!(target.read32(lo).unwrap(), target.read32(lo).unwrap());

        target.write32(TIMER_BASE + TIMER_CTL, TIMER_ENABLE).unwrap();
        let first = target.read32(lo).unwrap();
        assert!(target.read32(lo).unwrap() > first);
    }

    #[test]
    fn test_boot_args_record() {
        let mut target = SimTarget::new();
        let addr = target.get_bootargs().unwrap();
        let raw = target.read_memory(addr, crate::bootargs::BOOT_ARGS_SIZE).unwrap();
        let args = BootArgs::decode(&raw).unwrap();
        assert_eq!(u64::from(args.phys_base), SIM_RAM_BASE);
        assert_eq!(u64::from(args.mem_size), SIM_RAM_SIZE);
    }

    #[test]
    fn test_chosen_limit() {
        let mut target = SimTarget::new();
        for i in 0..MAX_CHOSEN_PARAMS {
            target.kboot_set_chosen(&format!("key{}", i), "v").unwrap();
        }
        // Replacing an existing key is still allowed.
        target.kboot_set_chosen("key0", "w").unwrap();
        assert_eq!(target.chosen("key0").as_deref(), Some("w"));
        assert!(matches!(
            target.kboot_set_chosen("one-too-many", "v"),
            Err(Error::TooManyOverrides(_))
        ));
    }

    #[test]
    fn test_prepare_patches_tree() {
        let mut target = SimTarget::new();
        let dtb = minimal_dtb();
        let addr = target.top_of_memory_alloc(dtb.len() as u64).unwrap();
        target.write_memory(addr, &dtb).unwrap();
        target.kboot_set_chosen("bootargs", "earlycon").unwrap();
        target.kboot_set_initrd(0x5000_0000, 0x1000).unwrap();

        assert_eq!(target.kboot_prepare_dt(addr).unwrap(), 0);
        let patched_addr = target.kboot_get_dt().unwrap();
        assert_ne!(patched_addr, 0);
        assert!(patched_addr < addr);

        let size = fdt::total_size(&target.peek(patched_addr, 8).unwrap()).unwrap();
        let fdt = Fdt::parse(&target.peek(patched_addr, size as usize).unwrap()).unwrap();
        let chosen = fdt.node("/chosen").unwrap();
        assert_eq!(chosen.property_str("bootargs"), Some("earlycon"));
        assert_eq!(chosen.property_u64("linux,initrd-end"), Some(0x5000_1000));
        assert!(fdt.reservations.contains(&(0x5000_0000, 0x1000)));
        assert!(fdt.reservations.iter().any(|&(a, _)| a == patched_addr));
        assert_eq!(
            fdt.node("/memory").unwrap().property_str("device_type"),
            Some("memory")
        );
    }

    #[test]
    fn test_prepare_garbage_fails() {
        let mut target = SimTarget::new();
        let addr = target.malloc(64).unwrap();
        target.write_memory(addr, &[0xff; 64]).unwrap();
        assert_eq!(target.kboot_prepare_dt(addr).unwrap(), -1);
        assert_eq!(target.kboot_get_dt().unwrap(), 0);
    }

    #[test]
    fn test_everything_rejected_after_boot() {
        let mut target = SimTarget::new();
        let entry = target.memalign(0x20_0000, 0x1000).unwrap();
        target.kboot_boot(entry).unwrap();
        assert_eq!(target.booted(), Some(entry));
        assert!(matches!(target.malloc(16), Err(Error::Io(_))));
        assert!(target.read32(entry).is_err());
        assert!(target.kboot_boot(entry).is_err());
    }
}
