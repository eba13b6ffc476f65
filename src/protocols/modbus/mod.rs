//! Modbus TCP protocol adapter.
//!
//! Split into the address grammar, the MBAP/PDU framing layer, the
//! register/value codec and the TCP transport itself.

pub mod address;
pub mod codec;
pub mod frame;
pub mod transport;

pub use address::{ModbusAddress, RegisterKind, DEFAULT_UNIT, MAX_BITS_PER_READ, MAX_REGISTERS_PER_READ};
pub use frame::DeviceIdentification;
pub use transport::{ModbusAdapter, ModbusOptions, ModbusTcpTransport};
