//! # fieldgate
//!
//! An industrial-IoT protocol gateway core: pooled connections to field
//! devices over heterogeneous fieldbus protocols, a uniform read/write API
//! over typed tags, and pattern-based device discovery.
//!
//! ## Architecture
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | Types & tags | [`core`] | Data model, addresses, errors, adapter contract |
//! | Events | [`events`] | Typed pub/sub with bounded history |
//! | Pool | [`pool`] | Transport ownership, leases, eviction, health checks |
//! | Adapters | [`protocols`] | Concrete protocol implementations (Modbus TCP) |
//! | Facade | [`device`] | Tag-set reads/writes with window coalescing |
//! | Patterns | [`patterns`] | Fingerprint -> optimal configuration store |
//! | Discovery | [`discovery`] | Network scan with pattern fast-path |
//! | Registry | [`registry`] | Known devices by id |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use fieldgate::prelude::*;
//! use std::sync::Arc;
//!
//! let bus = EventBus::global();
//! let pool = ConnectionPool::new(PoolConfig::default(), bus.clone())?;
//! let info = DeviceInfo::new("plc-1", ProtocolKind::ModbusTcp, "192.168.1.100");
//! let device = Device::new(info, Arc::new(ModbusAdapter::new()), pool, bus)?;
//!
//! let temperature = Tag::new("temperature", "40001", DataType::Float32)?
//!     .with_scaling(0.1, 0.0)?;
//! let readings = device.read(&[temperature]).await?;
//! ```

pub mod core;
pub mod device;
pub mod discovery;
pub mod events;
pub mod patterns;
pub mod pool;
pub mod protocols;
pub mod registry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::data::{DataType, Reading, Value};
    pub use crate::core::device::{parse_connection_uri, ConnectionParams, DeviceInfo, ProtocolKind};
    pub use crate::core::error::{GatewayError, ProtocolErrorKind, Result};
    pub use crate::core::quality::{BadKind, Quality};
    pub use crate::core::state::{ConnectionState, RetryPolicy};
    pub use crate::core::tag::{Tag, WordOrder};
    pub use crate::core::traits::{ProtocolAdapter, RawValue, Transport};
    pub use crate::device::{Device, WriteOutcome};
    pub use crate::discovery::{DiscoveredDevice, DiscoveryConfig, DiscoveryEngine, DiscoveryPath};
    pub use crate::events::{Event, EventBus, EventKind};
    pub use crate::patterns::{DevicePattern, Fingerprint, PatternStore};
    pub use crate::pool::{ConnectionPool, Lease, PoolConfig};
    pub use crate::protocols::modbus::{ModbusAdapter, ModbusOptions, ModbusTcpTransport};
    pub use crate::registry::DeviceRegistry;
}

// Re-export the most common types at the crate root.
pub use crate::core::data::{DataType, Reading, Value};
pub use crate::core::device::{DeviceInfo, ProtocolKind};
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::quality::Quality;
pub use crate::core::state::ConnectionState;
pub use crate::core::tag::Tag;
pub use crate::device::Device;
pub use crate::events::EventBus;
pub use crate::pool::ConnectionPool;
