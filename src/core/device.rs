//! Device identity and connection addressing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Fieldbus protocols the gateway recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Modbus TCP.
    ModbusTcp,
    /// Modbus RTU over serial.
    ModbusRtu,
    /// OPC UA.
    OpcUa,
    /// EtherNet/IP (CIP).
    EthernetIp,
    /// Siemens S7.
    S7,
}

impl ProtocolKind {
    /// URI scheme as accepted in connection strings.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ModbusTcp => "modbus_tcp",
            Self::ModbusRtu => "modbus_rtu",
            Self::OpcUa => "opcua",
            Self::EthernetIp => "ethernet_ip",
            Self::S7 => "s7",
        }
    }

    /// Default TCP/UDP port for the protocol.
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::ModbusTcp | Self::ModbusRtu => 502,
            Self::OpcUa => 4840,
            Self::EthernetIp => 44818,
            Self::S7 => 102,
        }
    }

    /// Parse a URI scheme. `modbus` is an alias for `modbus_tcp`.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "modbus" | "modbus_tcp" => Some(Self::ModbusTcp),
            "modbus_rtu" => Some(Self::ModbusRtu),
            "opcua" => Some(Self::OpcUa),
            "ethernet_ip" => Some(Self::EthernetIp),
            "s7" => Some(Self::S7),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters parsed out of a connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Target protocol.
    pub protocol: ProtocolKind,
    /// Host name or IP address.
    pub host: String,
    /// TCP/UDP port (default applied when the URI omits it).
    pub port: u16,
    /// Optional path segment (e.g. the Modbus unit id).
    pub path: Option<String>,
}

impl ConnectionParams {
    /// Render the canonical pool key: `<protocol>://<host>:<port>[/<path>]`.
    pub fn pool_key(&self) -> String {
        match &self.path {
            Some(path) => format!("{}://{}:{}/{}", self.protocol, self.host, self.port, path),
            None => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }
}

/// Parse a connection URI of the form `<protocol>://<host>[:<port>][/<path>]`.
pub fn parse_connection_uri(uri: &str) -> Result<ConnectionParams> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| GatewayError::invalid_request(format!("malformed connection URI: {uri}")))?;

    let protocol = ProtocolKind::from_scheme(scheme)
        .ok_or_else(|| GatewayError::invalid_request(format!("unknown protocol: {scheme}")))?;

    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) if !p.is_empty() => (a, Some(p.to_string())),
        Some((a, _)) => (a, None),
        None => (rest, None),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port = p.parse::<u16>().map_err(|_| {
                GatewayError::invalid_request(format!("invalid port in URI: {p}"))
            })?;
            (h, port)
        }
        None => (authority, protocol.default_port()),
    };

    if host.is_empty() {
        return Err(GatewayError::invalid_request(format!(
            "missing host in connection URI: {uri}"
        )));
    }

    Ok(ConnectionParams {
        protocol,
        host: host.to_string(),
        port,
        path,
    })
}

/// Identity and addressing of a field device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Process-unique device identifier.
    pub device_id: String,

    /// Protocol the device speaks.
    pub protocol: ProtocolKind,

    /// Host name or IP address.
    pub host: String,

    /// Port, if not the protocol default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Human-readable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Manufacturer, if identified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    /// Model number, if identified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Firmware revision, if identified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Device category (e.g. "PLC", "meter").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    /// Last time the device was seen on the network.
    pub last_seen: DateTime<Utc>,

    /// Free-form metadata collected during discovery.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DeviceInfo {
    /// Create a minimal device record for a host.
    pub fn new(device_id: impl Into<String>, protocol: ProtocolKind, host: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            host: host.into(),
            port: None,
            name: None,
            manufacturer: None,
            model: None,
            firmware_version: None,
            device_type: None,
            last_seen: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Effective port (explicit or protocol default).
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Render `<protocol>://<host>[:<port>]`.
    pub fn connection_string(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.protocol, self.host, port),
            None => format!("{}://{}", self.protocol, self.host),
        }
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}
