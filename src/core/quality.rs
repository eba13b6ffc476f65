//! Data quality codes.
//!
//! Quality indicates the trustworthiness of a reading, modeled on the
//! OPC UA severity scheme: good, uncertain, or bad with a subkind.

use serde::{Deserialize, Serialize};

/// Reason a reading is considered bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadKind {
    /// Communication with the device is lost.
    NotConnected,
    /// A communication attempt failed.
    CommFailure,
    /// The device reported an internal failure.
    DeviceFailure,
    /// The point is out of service.
    OutOfService,
    /// The tag or address configuration is wrong.
    ConfigError,
}

/// Reading trustworthiness indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Value is good and reliable.
    #[default]
    Good,

    /// Value quality is uncertain.
    Uncertain,

    /// Value is bad for the given reason.
    Bad(BadKind),
}

impl Quality {
    /// Check if the quality is good.
    #[inline]
    pub fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }

    /// Check if the quality is bad.
    #[inline]
    pub fn is_bad(&self) -> bool {
        matches!(self, Self::Bad(_))
    }

    /// Check if the quality indicates a connection problem.
    #[inline]
    pub fn is_connection_problem(&self) -> bool {
        matches!(self, Self::Bad(BadKind::NotConnected | BadKind::CommFailure))
    }

    /// Convert to an OPC UA status code (subset).
    pub fn to_opc_status(&self) -> u32 {
        match self {
            Self::Good => 0x0000_0000,
            Self::Uncertain => 0x4000_0000,
            Self::Bad(BadKind::NotConnected) => 0x8008_0000,
            Self::Bad(BadKind::CommFailure) => 0x8013_0000,
            Self::Bad(BadKind::DeviceFailure) => 0x8010_0000,
            Self::Bad(BadKind::OutOfService) => 0x8087_0000,
            Self::Bad(BadKind::ConfigError) => 0x8089_0000,
        }
    }

    /// Create from an OPC UA status code severity.
    pub fn from_opc_status(status: u32) -> Self {
        match status & 0xC000_0000 {
            0x0000_0000 => Self::Good,
            0x4000_0000 => Self::Uncertain,
            _ => Self::Bad(BadKind::DeviceFailure),
        }
    }

    /// Short description for logs and payloads.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Uncertain => "uncertain",
            Self::Bad(BadKind::NotConnected) => "bad.not_connected",
            Self::Bad(BadKind::CommFailure) => "bad.comm_failure",
            Self::Bad(BadKind::DeviceFailure) => "bad.device_failure",
            Self::Bad(BadKind::OutOfService) => "bad.out_of_service",
            Self::Bad(BadKind::ConfigError) => "bad.config_error",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_default() {
        assert_eq!(Quality::default(), Quality::Good);
    }

    #[test]
    fn test_quality_checks() {
        assert!(Quality::Good.is_good());
        assert!(!Quality::Good.is_bad());
        assert!(Quality::Bad(BadKind::CommFailure).is_bad());
        assert!(Quality::Bad(BadKind::NotConnected).is_connection_problem());
        assert!(!Quality::Bad(BadKind::ConfigError).is_connection_problem());
    }

    #[test]
    fn test_opc_status_round_trip() {
        assert_eq!(Quality::from_opc_status(0x0000_0000), Quality::Good);
        assert_eq!(Quality::from_opc_status(0x4000_0000), Quality::Uncertain);
        assert!(Quality::from_opc_status(0x8000_0000).is_bad());
        assert_eq!(
            Quality::Bad(BadKind::NotConnected).to_opc_status() & 0xC000_0000,
            0x8000_0000
        );
    }
}
