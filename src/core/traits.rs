//! Protocol adapter contract.
//!
//! A protocol plugin supplies two things: a [`Transport`] that owns one live
//! connection to a device, and a [`ProtocolAdapter`] that knows how to parse
//! connection strings and mint transports. The connection pool owns the
//! transports and guarantees at most one operation in flight per instance;
//! an adapter may parallelise internally but must serialise wire access per
//! connection.

use async_trait::async_trait;

use crate::core::device::{ConnectionParams, ProtocolKind};
use crate::core::error::Result;

/// A wire-level raw value as read from or written to a device.
///
/// Word-oriented protocols produce `Word`s (16-bit registers), bit-oriented
/// address spaces produce `Bit`s. Decoding into typed values is the facade's
/// job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    /// One 16-bit register.
    Word(u16),
    /// One coil or discrete input.
    Bit(bool),
}

impl RawValue {
    /// The register value, if this is a word.
    pub fn as_word(&self) -> Option<u16> {
        match self {
            Self::Word(w) => Some(*w),
            Self::Bit(_) => None,
        }
    }

    /// The bit value, if this is a bit.
    pub fn as_bit(&self) -> Option<bool> {
        match self {
            Self::Bit(b) => Some(*b),
            Self::Word(_) => None,
        }
    }
}

impl From<u16> for RawValue {
    fn from(w: u16) -> Self {
        Self::Word(w)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        Self::Bit(b)
    }
}

/// One live connection to a field device.
///
/// Implementations surface raw errors: `ConnectionFailed` when the transport
/// cannot be established within the connect timeout, `Timeout` on a deadline
/// miss, `Disconnected` when not connected, and `Protocol` for device or
/// framing faults. Reconnection is the pool's responsibility.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocol this transport speaks.
    fn protocol(&self) -> ProtocolKind;

    /// Endpoint identifier used as event source, e.g. `"modbus_tcp:10.0.0.5:502/1"`.
    fn endpoint(&self) -> &str;

    /// Whether the transport currently believes it is connected.
    fn is_connected(&self) -> bool;

    /// Establish the connection.
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection and release all transport resources. Idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Read `count` consecutive raw values starting at `address`.
    async fn read_raw(&mut self, address: &str, count: u16) -> Result<Vec<RawValue>>;

    /// Write raw values starting at `address`.
    async fn write_raw(&mut self, address: &str, values: &[RawValue]) -> Result<()>;

    /// Probe liveness without mutating device state.
    ///
    /// Each adapter defines its own minimal read; there is no generic probe.
    async fn is_healthy(&mut self) -> bool;
}

/// Factory side of a protocol plugin.
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol this adapter provides.
    fn protocol(&self) -> ProtocolKind;

    /// Parse a connection string into connection parameters.
    fn parse_connection_string(&self, uri: &str) -> Result<ConnectionParams>;

    /// Create an unconnected transport for the given parameters.
    fn create_transport(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_value_accessors() {
        assert_eq!(RawValue::Word(0x1234).as_word(), Some(0x1234));
        assert_eq!(RawValue::Word(0x1234).as_bit(), None);
        assert_eq!(RawValue::Bit(true).as_bit(), Some(true));
        assert_eq!(RawValue::from(7u16), RawValue::Word(7));
        assert_eq!(RawValue::from(false), RawValue::Bit(false));
    }
}
