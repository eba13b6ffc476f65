//! Error types for the gateway core.

use std::time::Duration;

use thiserror::Error;

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Classification of protocol-level faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    /// The address string could not be parsed or is out of range.
    InvalidAddress,
    /// The device answered with a Modbus exception response.
    ExceptionResponse,
    /// The response frame was truncated or inconsistent.
    Framing,
}

impl ProtocolErrorKind {
    /// Short identifier used in event payloads.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAddress => "invalid_address",
            Self::ExceptionResponse => "exception_response",
            Self::Framing => "framing",
        }
    }
}

/// The main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // === Connection Errors ===
    /// The transport could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected to the target (or the socket closed mid-request).
    #[error("not connected")]
    Disconnected,

    /// The pool is at capacity and no entry is returnable.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    // === Deadline Errors ===
    /// A deadline elapsed before the operation completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    // === Protocol Errors ===
    /// Device-reported or framing-level fault.
    #[error("protocol error [{}] code {code}: {message}", kind.as_str())]
    Protocol {
        /// Fault classification.
        kind: ProtocolErrorKind,
        /// Numeric code; Modbus exception codes are carried verbatim.
        code: u8,
        /// Human-readable description.
        message: String,
    },

    // === Request Errors ===
    /// Static pre-condition violation; never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // === IO Errors ===
    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // === Internal Errors ===
    /// Invariant violation (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Check if this is a transport-level (connection family) error.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::PoolExhausted
                | Self::PoolClosed
                | Self::Io(_)
        )
    }

    /// Check if this error indicates the transport needs a reconnect.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Disconnected | Self::Io(_)
        )
    }

    /// Check if a retry at the caller's discretion may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionFailed(_) | Self::Disconnected | Self::Io(_)
        )
    }

    /// Process exit code for embedding CLIs.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed(_)
            | Self::Disconnected
            | Self::PoolExhausted
            | Self::PoolClosed => 2,
            Self::Protocol { .. } => 3,
            Self::Timeout(_) => 4,
            _ => 1,
        }
    }

    /// Create a connection-failed error.
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Create an invalid-address protocol error.
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidAddress,
            code: 0,
            message: msg.into(),
        }
    }

    /// Create an exception-response protocol error with the device's code.
    pub fn exception(code: u8, msg: impl Into<String>) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::ExceptionResponse,
            code,
            message: msg.into(),
        }
    }

    /// Create a framing protocol error.
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::Framing,
            code: 0,
            message: msg.into(),
        }
    }

    /// Create an invalid-request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_family() {
        assert!(GatewayError::Disconnected.is_connection());
        assert!(GatewayError::connection_failed("refused").is_connection());
        assert!(GatewayError::PoolExhausted.is_connection());
        assert!(!GatewayError::invalid_request("nope").is_connection());
    }

    #[test]
    fn test_is_retryable() {
        assert!(GatewayError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(GatewayError::Disconnected.is_retryable());
        assert!(!GatewayError::invalid_request("read-only").is_retryable());
        assert!(!GatewayError::exception(2, "illegal data address").is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(GatewayError::connection_failed("x").exit_code(), 2);
        assert_eq!(GatewayError::exception(1, "x").exit_code(), 3);
        assert_eq!(GatewayError::Timeout(Duration::from_secs(1)).exit_code(), 4);
        assert_eq!(GatewayError::internal("x").exit_code(), 1);
    }

    #[test]
    fn test_invalid_address_kind() {
        match GatewayError::invalid_address("bad") {
            GatewayError::Protocol { kind, code, .. } => {
                assert_eq!(kind, ProtocolErrorKind::InvalidAddress);
                assert_eq!(code, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
