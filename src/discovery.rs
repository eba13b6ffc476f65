//! Device discovery: network scanning, fingerprinting, and the pattern
//! fast-path.

mod engine;
mod probe;

pub use engine::{
    DeviceStream, DiscoveredDevice, DiscoveryConfig, DiscoveryEngine, DiscoveryPath, ProbeProtocol,
};
pub use probe::{probe_bootp, probe_ethernet_ip, probe_modbus, ProbeResult};
