//! FDT serializer.

use super::{
    FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_PROP, FDT_VERSION,
    HEADER_SIZE,
};
use crate::error::{Error, Result};

/// Streaming writer for a flattened device tree.
///
/// Nodes are opened and closed explicitly; properties go to the innermost
/// open node. Property names are interned in the strings block.
///
/// ```rust
/// use proxyboot::fdt::{Fdt, FdtBuilder};
///
/// let mut b = FdtBuilder::new();
/// b.begin_node("");
/// b.begin_node("chosen");
/// b.property_string("bootargs", "console=ttyS0");
/// b.end_node();
/// b.end_node();
/// let blob = b.finish()?;
///
/// let fdt = Fdt::parse(&blob)?;
/// assert_eq!(fdt.node("/chosen").unwrap().property_str("bootargs"), Some("console=ttyS0"));
/// # Ok::<(), proxyboot::Error>(())
/// ```
pub struct FdtBuilder {
    buffer: Vec<u8>,
    strings: Vec<u8>,
    string_offsets: Vec<(String, u32)>,
    reservations: Vec<(u64, u64)>,
    boot_cpuid_phys: u32,
    depth: usize,
    // Set when a node is closed below the root.
    unbalanced: bool,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            strings: Vec::new(),
            string_offsets: Vec::new(),
            reservations: Vec::new(),
            boot_cpuid_phys: 0,
            depth: 0,
            unbalanced: false,
        }
    }

    /// Add a memory reservation entry.
    pub fn reserve(&mut self, address: u64, size: u64) -> &mut Self {
        self.reservations.push((address, size));
        self
    }

    pub fn boot_cpuid_phys(&mut self, cpu: u32) -> &mut Self {
        self.boot_cpuid_phys = cpu;
        self
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.write_u32(FDT_BEGIN_NODE);
        self.write_string(name);
        self.depth += 1;
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        if self.depth == 0 {
            self.unbalanced = true;
        } else {
            self.depth -= 1;
        }
        self.write_u32(FDT_END_NODE);
        self
    }

    /// Add a property with a raw value.
    pub fn property(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_off = self.add_string(name);
        self.write_u32(FDT_PROP);
        self.write_u32(value.len() as u32);
        self.write_u32(name_off);
        self.buffer.extend_from_slice(value);
        self.align4();
        self
    }

    pub fn property_empty(&mut self, name: &str) -> &mut Self {
        self.property(name, &[])
    }

    pub fn property_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.property(name, &value.to_be_bytes())
    }

    pub fn property_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.property(name, &value.to_be_bytes())
    }

    /// Add a NUL-terminated string property.
    pub fn property_string(&mut self, name: &str, value: &str) -> &mut Self {
        let value_bytes: Vec<u8> = value.bytes().chain(std::iter::once(0)).collect();
        self.property(name, &value_bytes)
    }

    /// Close the structure block and lay out the blob.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if self.depth != 0 || self.unbalanced {
            return Err(Error::Fdt(format!(
                "unbalanced nodes ({} left open)",
                self.depth
            )));
        }
        self.write_u32(FDT_END);

        let struct_size = self.buffer.len();
        let strings_size = self.strings.len();
        // One 16-byte entry per reservation plus the terminating entry.
        let mem_rsvmap_size = (self.reservations.len() + 1) * 16;

        let off_mem_rsvmap = HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + mem_rsvmap_size;
        let off_dt_strings = off_dt_struct + struct_size;
        let total_size = off_dt_strings + strings_size;

        let mut fdt = Vec::with_capacity(total_size);

        fdt.extend_from_slice(&FDT_MAGIC.to_be_bytes());
        fdt.extend_from_slice(&(total_size as u32).to_be_bytes());
        fdt.extend_from_slice(&(off_dt_struct as u32).to_be_bytes());
        fdt.extend_from_slice(&(off_dt_strings as u32).to_be_bytes());
        fdt.extend_from_slice(&(off_mem_rsvmap as u32).to_be_bytes());
        fdt.extend_from_slice(&FDT_VERSION.to_be_bytes());
        fdt.extend_from_slice(&FDT_LAST_COMP_VERSION.to_be_bytes());
        fdt.extend_from_slice(&self.boot_cpuid_phys.to_be_bytes());
        fdt.extend_from_slice(&(strings_size as u32).to_be_bytes());
        fdt.extend_from_slice(&(struct_size as u32).to_be_bytes());

        for (address, size) in &self.reservations {
            fdt.extend_from_slice(&address.to_be_bytes());
            fdt.extend_from_slice(&size.to_be_bytes());
        }
        fdt.extend_from_slice(&0u64.to_be_bytes());
        fdt.extend_from_slice(&0u64.to_be_bytes());

        fdt.extend_from_slice(&self.buffer);
        fdt.extend_from_slice(&self.strings);

        Ok(fdt)
    }

    fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    fn write_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
        self.align4();
    }

    fn align4(&mut self) {
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
    }

    fn add_string(&mut self, s: &str) -> u32 {
        if let Some((_, offset)) = self.string_offsets.iter().find(|(existing, _)| existing == s) {
            return *offset;
        }

        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.string_offsets.push((s.to_string(), offset));
        offset
    }
}

impl Default for FdtBuilder {
    fn default() -> Self {
        Self::new()
    }
}
