//! Read/write window planning.
//!
//! Tags are grouped by (register kind, unit), sorted by offset, and covered
//! by the minimum number of contiguous windows that respect the per-request
//! capacity of the register type. Reads tolerate overlapping tags; writes
//! require exactly adjacent spans so the value image is unambiguous.

use std::collections::BTreeMap;

use crate::core::error::{GatewayError, Result};
use crate::core::tag::Tag;
use crate::protocols::modbus::{ModbusAddress, RegisterKind};

/// One tag resolved against the Modbus address space.
#[derive(Debug, Clone)]
pub struct TagBinding {
    /// Index into the caller's tag slice.
    pub index: usize,
    /// Parsed address.
    pub address: ModbusAddress,
    /// Raw values (registers or bits) the tag occupies.
    pub width: u16,
}

impl TagBinding {
    /// Resolve a tag's address and width.
    pub fn bind(index: usize, tag: &Tag) -> Result<Self> {
        let address = ModbusAddress::parse(&tag.address)?;
        let width = if address.kind.is_bit() {
            address.count
        } else if address.count > 1 {
            // Explicit span from the address, e.g. a string register block.
            address.count
        } else {
            tag.data_type.register_count()
        };
        if width > address.kind.max_per_request() {
            return Err(GatewayError::invalid_address(format!(
                "tag '{}' spans {width} values, over the {} limit of {}",
                tag.name,
                address.kind,
                address.kind.max_per_request()
            )));
        }
        if address.offset as u32 + width as u32 > 0x1_0000 {
            return Err(GatewayError::invalid_address(format!(
                "tag '{}' runs past the end of the address space",
                tag.name
            )));
        }
        Ok(Self {
            index,
            address,
            width,
        })
    }

    fn end(&self) -> u32 {
        self.address.offset as u32 + self.width as u32
    }
}

/// A planned wire request covering one or more tags.
#[derive(Debug, Clone)]
pub struct Window {
    /// Register type of every tag in the window.
    pub kind: RegisterKind,
    /// Slave unit.
    pub unit: u8,
    /// First covered offset.
    pub start: u16,
    /// Number of covered values.
    pub count: u16,
    /// Member tags, sorted by offset.
    pub tags: Vec<TagBinding>,
}

impl Window {
    /// Wire address string for this window (count passed separately).
    pub fn address(&self) -> String {
        format!("{}:{}@{}", self.kind, self.start, self.unit)
    }

    /// Offset of a member tag relative to the window start.
    pub fn relative_offset(&self, binding: &TagBinding) -> usize {
        (binding.address.offset - self.start) as usize
    }
}

fn group(bindings: Vec<TagBinding>) -> BTreeMap<(RegisterKind, u8), Vec<TagBinding>> {
    let mut groups: BTreeMap<(RegisterKind, u8), Vec<TagBinding>> = BTreeMap::new();
    for binding in bindings {
        groups
            .entry((binding.address.kind, binding.address.unit))
            .or_default()
            .push(binding);
    }
    for members in groups.values_mut() {
        members.sort_by_key(|b| b.address.offset);
    }
    groups
}

/// Plan a minimum-cardinality cover of contiguous read windows.
///
/// Tags may overlap; a gap between tags always starts a new window.
pub fn plan_read_windows(bindings: Vec<TagBinding>) -> Vec<Window> {
    let mut windows = Vec::new();
    for ((kind, unit), members) in group(bindings) {
        let capacity = kind.max_per_request() as u32;
        let mut current: Option<Window> = None;
        let mut current_end: u32 = 0;

        for binding in members {
            let fits = current.as_ref().is_some_and(|w| {
                binding.address.offset as u32 <= current_end
                    && binding.end() - w.start as u32 <= capacity
            });
            if fits {
                let window = current.as_mut().expect("window checked above");
                current_end = current_end.max(binding.end());
                window.count = (current_end - window.start as u32) as u16;
                window.tags.push(binding);
            } else {
                if let Some(done) = current.take() {
                    windows.push(done);
                }
                current_end = binding.end();
                current = Some(Window {
                    kind,
                    unit,
                    start: binding.address.offset,
                    count: binding.width,
                    tags: vec![binding],
                });
            }
        }
        if let Some(done) = current {
            windows.push(done);
        }
    }
    windows
}

/// Plan write runs: exactly adjacent tags merge, anything else splits.
pub fn plan_write_runs(bindings: Vec<TagBinding>) -> Vec<Window> {
    let mut runs = Vec::new();
    for ((kind, unit), members) in group(bindings) {
        let capacity = kind.max_per_request() as u32;
        let mut current: Option<Window> = None;
        let mut current_end: u32 = 0;

        for binding in members {
            let fits = current.as_ref().is_some_and(|w| {
                binding.address.offset as u32 == current_end
                    && binding.end() - w.start as u32 <= capacity
            });
            if fits {
                let run = current.as_mut().expect("run checked above");
                current_end = binding.end();
                run.count = (current_end - run.start as u32) as u16;
                run.tags.push(binding);
            } else {
                if let Some(done) = current.take() {
                    runs.push(done);
                }
                current_end = binding.end();
                current = Some(Window {
                    kind,
                    unit,
                    start: binding.address.offset,
                    count: binding.width,
                    tags: vec![binding],
                });
            }
        }
        if let Some(done) = current {
            runs.push(done);
        }
    }
    runs
}
