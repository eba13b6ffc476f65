//! Modbus address grammar.
//!
//! Accepted forms:
//!
//! - `"<reg_type>:<offset>"` with `reg_type` one of `coil`, `discrete`,
//!   `input`, `holding` and a 0-based raw offset, e.g. `"holding:100"`.
//! - Bare numeric, routed by the conventional ranges: coils 1–9999,
//!   discrete inputs 10001–19999, input registers 30001–39999, holding
//!   registers 40001–49999. `"40001"` is holding offset 0.
//! - An optional `:<count>` suffix: read `count` consecutive registers
//!   starting at the address, e.g. `"40001:3"` or `"holding:0:3"`.
//! - An optional `@<unit>` suffix selecting the slave unit, e.g.
//!   `"40001@2"`. Default unit is 1.
//!
//! Any parse failure is a `Protocol` error with kind `invalid_address`,
//! raised before any I/O.

use crate::core::error::{GatewayError, Result};

/// Maximum registers per read for word-oriented register types.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Maximum coils/discretes per read for bit-oriented register types.
pub const MAX_BITS_PER_READ: u16 = 2000;

/// Default slave unit id for Modbus TCP.
pub const DEFAULT_UNIT: u8 = 1;

/// The four Modbus register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    /// Read/write single bits (FC 01/05/15).
    Coil,
    /// Read-only bits (FC 02).
    Discrete,
    /// Read-only 16-bit registers (FC 04).
    Input,
    /// Read/write 16-bit registers (FC 03/06/16).
    Holding,
}

impl RegisterKind {
    /// Keyword as used in the address grammar.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Coil => "coil",
            Self::Discrete => "discrete",
            Self::Input => "input",
            Self::Holding => "holding",
        }
    }

    fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "coil" => Some(Self::Coil),
            "discrete" => Some(Self::Discrete),
            "input" => Some(Self::Input),
            "holding" => Some(Self::Holding),
            _ => None,
        }
    }

    /// Function code used to read this register type.
    pub const fn read_function(&self) -> u8 {
        match self {
            Self::Coil => 0x01,
            Self::Discrete => 0x02,
            Self::Holding => 0x03,
            Self::Input => 0x04,
        }
    }

    /// Function code for a single-value write, if writable.
    pub const fn write_single_function(&self) -> Option<u8> {
        match self {
            Self::Coil => Some(0x05),
            Self::Holding => Some(0x06),
            Self::Discrete | Self::Input => None,
        }
    }

    /// Function code for a multi-value write, if writable.
    pub const fn write_multiple_function(&self) -> Option<u8> {
        match self {
            Self::Coil => Some(0x0F),
            Self::Holding => Some(0x10),
            Self::Discrete | Self::Input => None,
        }
    }

    /// Check if this register type carries bits rather than words.
    #[inline]
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }

    /// Check if writes are rejected at the protocol level.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Discrete | Self::Input)
    }

    /// Maximum values one request may cover for this register type.
    pub const fn max_per_request(&self) -> u16 {
        match self {
            Self::Coil | Self::Discrete => MAX_BITS_PER_READ,
            Self::Input | Self::Holding => MAX_REGISTERS_PER_READ,
        }
    }

    /// Route a conventional numeric address to its register type and
    /// 0-based offset.
    pub fn route_numeric(addr: u32) -> Option<(Self, u16)> {
        match addr {
            1..=9999 => Some((Self::Coil, (addr - 1) as u16)),
            10001..=19999 => Some((Self::Discrete, (addr - 10001) as u16)),
            30001..=39999 => Some((Self::Input, (addr - 30001) as u16)),
            40001..=49999 => Some((Self::Holding, (addr - 40001) as u16)),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully resolved Modbus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModbusAddress {
    /// Register type.
    pub kind: RegisterKind,
    /// 0-based wire offset.
    pub offset: u16,
    /// Number of consecutive values covered.
    pub count: u16,
    /// Slave unit id.
    pub unit: u8,
}

impl ModbusAddress {
    /// Create an address covering a single value on the default unit.
    pub fn single(kind: RegisterKind, offset: u16) -> Self {
        Self {
            kind,
            offset,
            count: 1,
            unit: DEFAULT_UNIT,
        }
    }

    /// Widen the covered span.
    #[must_use]
    pub fn with_count(mut self, count: u16) -> Self {
        self.count = count;
        self
    }

    /// Select the slave unit.
    #[must_use]
    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = unit;
        self
    }

    /// Exclusive end offset of the covered span.
    pub fn end(&self) -> u32 {
        self.offset as u32 + self.count as u32
    }

    /// Parse an address string per the module grammar.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(GatewayError::invalid_address("empty address"));
        }

        // Peel the unit suffix first.
        let (body, unit) = match address.split_once('@') {
            Some((body, unit_str)) => {
                let unit = unit_str.parse::<u8>().map_err(|_| {
                    GatewayError::invalid_address(format!("invalid unit id: {unit_str}"))
                })?;
                if unit == 0 {
                    return Err(GatewayError::invalid_address("unit id must be >= 1"));
                }
                (body, unit)
            }
            None => (address, DEFAULT_UNIT),
        };

        let parts: Vec<&str> = body.split(':').collect();
        let (kind, offset, count) = match parts.as_slice() {
            [numeric] => {
                let (kind, offset) = Self::route(numeric)?;
                (kind, offset, 1)
            }
            [first, second] => match RegisterKind::from_keyword(first) {
                Some(kind) => (kind, Self::parse_offset(second)?, 1),
                None => {
                    let (kind, offset) = Self::route(first)?;
                    (kind, offset, Self::parse_count(second)?)
                }
            },
            [first, second, third] => {
                let kind = RegisterKind::from_keyword(first).ok_or_else(|| {
                    GatewayError::invalid_address(format!("unknown register type: {first}"))
                })?;
                (kind, Self::parse_offset(second)?, Self::parse_count(third)?)
            }
            _ => {
                return Err(GatewayError::invalid_address(format!(
                    "malformed address: {address}"
                )))
            }
        };

        if count == 0 {
            return Err(GatewayError::invalid_address("count must be >= 1"));
        }
        if count > kind.max_per_request() {
            return Err(GatewayError::invalid_address(format!(
                "count {count} exceeds {} limit of {}",
                kind,
                kind.max_per_request()
            )));
        }
        if offset as u32 + count as u32 > 0x1_0000 {
            return Err(GatewayError::invalid_address(format!(
                "span {offset}+{count} exceeds the 16-bit address space"
            )));
        }

        Ok(Self {
            kind,
            offset,
            count,
            unit,
        })
    }

    fn route(numeric: &str) -> Result<(RegisterKind, u16)> {
        let addr = numeric.parse::<u32>().map_err(|_| {
            GatewayError::invalid_address(format!("not a numeric address: {numeric}"))
        })?;
        RegisterKind::route_numeric(addr).ok_or_else(|| {
            GatewayError::invalid_address(format!("address {addr} is outside every register range"))
        })
    }

    fn parse_offset(s: &str) -> Result<u16> {
        s.parse::<u16>()
            .map_err(|_| GatewayError::invalid_address(format!("invalid register offset: {s}")))
    }

    fn parse_count(s: &str) -> Result<u16> {
        s.parse::<u16>()
            .map_err(|_| GatewayError::invalid_address(format!("invalid count: {s}")))
    }
}

impl std::fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}@{}", self.kind, self.offset, self.count, self.unit)
    }
}
