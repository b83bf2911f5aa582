//! In-memory device tree: parse, look up, edit, serialize.

use super::{
    be32, be64, FdtBuilder, FdtHeader, FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_NOP, FDT_PROP,
};
use crate::error::{Error, Result};

const LOG: &str = "proxyboot::fdt";

/// A named property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

impl Property {
    /// Value as a string, without the trailing NUL.
    pub fn as_str(&self) -> Option<&str> {
        let bytes = self.value.strip_suffix(&[0]).unwrap_or(&self.value[..]);
        std::str::from_utf8(bytes).ok()
    }

    pub fn as_u32(&self) -> Option<u32> {
        (self.value.len() == 4).then(|| be32(&self.value, 0))
    }

    pub fn as_u64(&self) -> Option<u64> {
        (self.value.len() == 8).then(|| be64(&self.value, 0))
    }
}

/// A device tree node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(Property::as_str)
    }

    pub fn property_u32(&self, name: &str) -> Option<u32> {
        self.property(name).and_then(Property::as_u32)
    }

    pub fn property_u64(&self, name: &str) -> Option<u64> {
        self.property(name).and_then(Property::as_u64)
    }

    /// Insert or replace a property.
    pub fn set_property(&mut self, name: &str, value: Vec<u8>) {
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.properties.push(Property {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn set_property_str(&mut self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.set_property(name, bytes);
    }

    pub fn set_property_u64(&mut self, name: &str, value: u64) {
        self.set_property(name, value.to_be_bytes().to_vec());
    }

    /// Set `reg` to one (address, size) pair of two cells each.
    pub fn set_reg64(&mut self, address: u64, size: u64) {
        let mut value = address.to_be_bytes().to_vec();
        value.extend_from_slice(&size.to_be_bytes());
        self.set_property("reg", value);
    }

    /// Child by exact name, or by base name when the child has a unit address
    /// (`memory` matches `memory@800000000`).
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.children.iter().find(|c| base_name(&c.name) == name))
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        let index = self
            .children
            .iter()
            .position(|c| c.name == name)
            .or_else(|| self.children.iter().position(|c| base_name(&c.name) == name))?;
        Some(&mut self.children[index])
    }

    /// Child by name, created empty when missing.
    pub fn child_or_insert(&mut self, name: &str) -> &mut Node {
        let index = match self.children.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.children.push(Node::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[index]
    }

    fn write(&self, builder: &mut FdtBuilder) {
        builder.begin_node(&self.name);
        for prop in &self.properties {
            builder.property(&prop.name, &prop.value);
        }
        for child in &self.children {
            child.write(builder);
        }
        builder.end_node();
    }
}

fn base_name(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

/// A parsed flattened device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fdt {
    pub boot_cpuid_phys: u32,
    pub reservations: Vec<(u64, u64)>,
    pub root: Node,
}

impl Fdt {
    /// Parse a complete blob.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let header = FdtHeader::decode(blob)?;
        let blob = &blob[..header.total_size as usize];

        let mut reservations = Vec::new();
        let mut off = header.off_mem_rsvmap as usize;
        loop {
            if off + 16 > blob.len() {
                return Err(Error::Fdt("unterminated memory reservation map".into()));
            }
            let (address, size) = (be64(blob, off), be64(blob, off + 8));
            off += 16;
            if address == 0 && size == 0 {
                break;
            }
            reservations.push((address, size));
        }

        let start = header.off_dt_struct as usize;
        let structure = &blob[start..start + header.size_dt_struct as usize];
        let strings_start = header.off_dt_strings as usize;
        let strings = &blob[strings_start..strings_start + header.size_dt_strings as usize];

        let mut cursor = Cursor {
            buf: structure,
            pos: 0,
        };
        cursor.skip_nops();
        if cursor.u32()? != FDT_BEGIN_NODE {
            return Err(Error::Fdt("structure block does not start with a node".into()));
        }
        let root = parse_node(&mut cursor, strings, 0)?;
        cursor.skip_nops();
        if cursor.u32()? != FDT_END {
            return Err(Error::Fdt("missing FDT_END after the root node".into()));
        }

        log::debug!(
            target: LOG,
            "parsed {} byte blob, {} reservations",
            header.total_size,
            reservations.len()
        );

        Ok(Self {
            boot_cpuid_phys: header.boot_cpuid_phys,
            reservations,
            root,
        })
    }

    /// Look up a node by absolute path (`/`, `/chosen`, `/cpus/cpu@0`).
    pub fn node(&self, path: &str) -> Option<&Node> {
        let mut node = &self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.child(component)?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.child_mut(component)?;
        }
        Some(node)
    }

    /// Serialize back into a blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut builder = FdtBuilder::new();
        builder.boot_cpuid_phys(self.boot_cpuid_phys);
        for &(address, size) in &self.reservations {
            builder.reserve(address, size);
        }
        self.root.write(&mut builder);
        builder.finish()
    }
}

/// Nesting deeper than this is treated as corruption.
const MAX_DEPTH: usize = 64;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.buf.len() {
            return Err(Error::Fdt("structure block truncated".into()));
        }
        let value = be32(self.buf, self.pos);
        self.pos += 4;
        Ok(value)
    }

    fn peek_u32(&self) -> Option<u32> {
        (self.pos + 4 <= self.buf.len()).then(|| be32(self.buf, self.pos))
    }

    fn skip_nops(&mut self) {
        while self.peek_u32() == Some(FDT_NOP) {
            self.pos += 4;
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Fdt("property runs past the structure block".into()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = align4(end);
        Ok(bytes)
    }

    fn name(&mut self) -> Result<String> {
        let rest = self.buf.get(self.pos..).unwrap_or(&[]);
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Fdt("unterminated node name".into()))?;
        let name = std::str::from_utf8(&rest[..len])
            .map_err(|_| Error::Fdt("node name is not UTF-8".into()))?
            .to_string();
        self.pos = align4(self.pos + len + 1);
        Ok(name)
    }
}

fn align4(off: usize) -> usize {
    (off + 3) & !3
}

fn string_at(strings: &[u8], off: usize) -> Result<String> {
    let rest = strings
        .get(off..)
        .ok_or_else(|| Error::Fdt(format!("string offset {} out of range", off)))?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Fdt("unterminated property name".into()))?;
    std::str::from_utf8(&rest[..len])
        .map(str::to_string)
        .map_err(|_| Error::Fdt("property name is not UTF-8".into()))
}

// Called with the cursor just past an FDT_BEGIN_NODE token.
fn parse_node(cursor: &mut Cursor<'_>, strings: &[u8], depth: usize) -> Result<Node> {
    if depth > MAX_DEPTH {
        return Err(Error::Fdt("nodes nested too deeply".into()));
    }

    let mut node = Node::new(cursor.name()?);
    loop {
        match cursor.u32()? {
            FDT_PROP => {
                let len = cursor.u32()? as usize;
                let name_off = cursor.u32()? as usize;
                let value = cursor.bytes(len)?.to_vec();
                node.properties.push(Property {
                    name: string_at(strings, name_off)?,
                    value,
                });
            }
            FDT_BEGIN_NODE => node.children.push(parse_node(cursor, strings, depth + 1)?),
            FDT_END_NODE => return Ok(node),
            FDT_NOP => {}
            token => {
                return Err(Error::Fdt(format!(
                    "unexpected token {:#x} at offset {}",
                    token,
                    cursor.pos - 4
                )))
            }
        }
    }
}
