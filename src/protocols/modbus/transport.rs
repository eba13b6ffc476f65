//! Modbus TCP transport.
//!
//! One instance owns one TCP socket. The pool serialises callers, so the
//! transport keeps a single in-flight transaction and verifies that the
//! response transaction id matches. On a deadline miss or a framing
//! desynchronisation the socket is closed rather than risk matching a stale
//! response to a later request.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::core::device::{ConnectionParams, ProtocolKind};
use crate::core::error::{GatewayError, ProtocolErrorKind, Result};
use crate::core::traits::{ProtocolAdapter, RawValue, Transport};

use super::address::{ModbusAddress, RegisterKind, DEFAULT_UNIT};
use super::frame;

/// Modbus TCP wire options.
#[derive(Debug, Clone)]
pub struct ModbusOptions {
    /// TCP connect deadline.
    pub connect_timeout: Duration,

    /// Per-request deadline (write + response).
    pub request_timeout: Duration,

    /// Minimum delay between consecutive requests. Only applied when a
    /// device pattern prescribes one.
    pub inter_request_delay: Option<Duration>,

    /// Holding-register offset probed by `is_healthy`.
    pub health_probe_offset: u16,
}

impl Default for ModbusOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            inter_request_delay: None,
            health_probe_offset: 0,
        }
    }
}

impl ModbusOptions {
    /// Set the connect deadline.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the inter-request delay.
    #[must_use]
    pub fn with_inter_request_delay(mut self, delay: Duration) -> Self {
        self.inter_request_delay = Some(delay);
        self
    }

    /// Set the health probe register offset.
    #[must_use]
    pub fn with_health_probe_offset(mut self, offset: u16) -> Self {
        self.health_probe_offset = offset;
        self
    }
}

/// A Modbus TCP connection to one device (or gateway).
pub struct ModbusTcpTransport {
    host: String,
    port: u16,
    unit: u8,
    options: ModbusOptions,
    endpoint: String,
    stream: Option<TcpStream>,
    transaction_id: u16,
    last_request: Option<tokio::time::Instant>,
}

impl ModbusTcpTransport {
    /// Create an unconnected transport.
    pub fn new(host: impl Into<String>, port: u16, unit: u8, options: ModbusOptions) -> Self {
        let host = host.into();
        let endpoint = format!("{}:{host}:{port}/{unit}", ProtocolKind::ModbusTcp);
        Self {
            host,
            port,
            unit,
            options,
            endpoint,
            stream: None,
            transaction_id: 0,
            last_request: None,
        }
    }

    /// The default slave unit for this transport.
    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Send one PDU and read the matching response PDU.
    async fn transact(&mut self, unit: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(GatewayError::Disconnected);
        };

        if let (Some(delay), Some(last)) = (self.options.inter_request_delay, self.last_request) {
            let since = last.elapsed();
            if since < delay {
                tokio::time::sleep(delay - since).await;
            }
        }

        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let request = frame::encode_frame(tid, unit, pdu);

        let exchange = async {
            stream.write_all(&request).await?;
            let mut header = [0u8; frame::MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let header = frame::decode_header(&header)?;
            let mut body = vec![0u8; header.length as usize - 1];
            stream.read_exact(&mut body).await?;
            Ok::<_, GatewayError>((header, body))
        };

        let outcome = match timeout(self.options.request_timeout, exchange).await {
            Err(_) => {
                // Close the socket so a late response cannot be matched to a
                // later transaction.
                self.stream = None;
                return Err(GatewayError::Timeout(self.options.request_timeout));
            }
            Ok(outcome) => outcome,
        };
        self.last_request = Some(tokio::time::Instant::now());

        match outcome {
            Ok((header, body)) => {
                if header.transaction_id != tid {
                    self.stream = None;
                    return Err(GatewayError::framing(format!(
                        "transaction id mismatch: sent {tid}, got {}",
                        header.transaction_id
                    )));
                }
                Ok(body)
            }
            Err(GatewayError::Io(err)) => {
                self.stream = None;
                match err.kind() {
                    std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe => Err(GatewayError::Disconnected),
                    _ => Err(GatewayError::Io(err)),
                }
            }
            Err(err @ GatewayError::Protocol { kind: ProtocolErrorKind::Framing, .. }) => {
                // Desynchronised; the stream cannot be trusted any more.
                self.stream = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Read device identification via FC 43 (best effort).
    pub async fn read_device_identification(&mut self) -> Result<frame::DeviceIdentification> {
        let pdu = frame::read_device_id_request();
        let unit = self.unit;
        let response = self.transact(unit, &pdu).await?;
        frame::parse_device_id(&response)
    }
}

#[async_trait]
impl Transport for ModbusTcpTransport {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::ModbusTcp
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        // Reconnects always dial fresh.
        self.stream = None;
        let addr = (self.host.as_str(), self.port);
        match timeout(self.options.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => Err(GatewayError::connection_failed(format!(
                "connect to {}:{} timed out after {:?}",
                self.host, self.port, self.options.connect_timeout
            ))),
            Ok(Err(err)) => Err(GatewayError::connection_failed(format!(
                "connect to {}:{} failed: {err}",
                self.host, self.port
            ))),
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                self.stream = Some(stream);
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }

    async fn read_raw(&mut self, address: &str, count: u16) -> Result<Vec<RawValue>> {
        let addr = ModbusAddress::parse(address)?;
        let count = if count > 1 { count } else { addr.count };
        if count > addr.kind.max_per_request() {
            return Err(GatewayError::invalid_address(format!(
                "count {count} exceeds {} limit of {}",
                addr.kind,
                addr.kind.max_per_request()
            )));
        }

        let pdu = frame::read_request(addr.kind, addr.offset, count);
        let response = self.transact(addr.unit, &pdu).await?;

        if addr.kind.is_bit() {
            let bits = frame::parse_read_bits(&response, addr.kind, count)?;
            Ok(bits.into_iter().map(RawValue::Bit).collect())
        } else {
            let words = frame::parse_read_words(&response, addr.kind, count)?;
            Ok(words.into_iter().map(RawValue::Word).collect())
        }
    }

    async fn write_raw(&mut self, address: &str, values: &[RawValue]) -> Result<()> {
        let addr = ModbusAddress::parse(address)?;
        if values.is_empty() {
            return Err(GatewayError::invalid_request("no values to write"));
        }
        if addr.kind.is_read_only() {
            return Err(GatewayError::invalid_request(format!(
                "{} registers are read-only",
                addr.kind
            )));
        }

        let pdu = if addr.kind.is_bit() {
            let bits: Vec<bool> = values
                .iter()
                .map(|v| {
                    v.as_bit().ok_or_else(|| {
                        GatewayError::invalid_request("coil write expects bit values")
                    })
                })
                .collect::<Result<_>>()?;
            if bits.len() == 1 {
                frame::write_single_coil(addr.offset, bits[0])
            } else {
                frame::write_multiple_coils(addr.offset, &bits)
            }
        } else {
            let words: Vec<u16> = values
                .iter()
                .map(|v| {
                    v.as_word().ok_or_else(|| {
                        GatewayError::invalid_request("register write expects word values")
                    })
                })
                .collect::<Result<_>>()?;
            if words.len() == 1 {
                frame::write_single_register(addr.offset, words[0])
            } else {
                frame::write_multiple_registers(addr.offset, &words)
            }
        };

        let request_fc = pdu[0];
        let response = self.transact(addr.unit, &pdu).await?;
        frame::parse_write_ack(&response, request_fc)
    }

    async fn is_healthy(&mut self) -> bool {
        if self.stream.is_none() {
            return false;
        }
        let probe = ModbusAddress::single(RegisterKind::Holding, self.options.health_probe_offset)
            .with_unit(self.unit);
        match self.read_raw(&probe.to_string(), 1).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(endpoint = %self.endpoint, error = %err, "health probe failed");
                false
            }
        }
    }
}

/// Adapter entry point for Modbus TCP.
#[derive(Debug, Clone, Default)]
pub struct ModbusAdapter {
    /// Options applied to every transport this adapter creates.
    pub options: ModbusOptions,
}

impl ModbusAdapter {
    /// Create an adapter with default wire options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter with custom wire options.
    pub fn with_options(options: ModbusOptions) -> Self {
        Self { options }
    }
}

impl ProtocolAdapter for ModbusAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::ModbusTcp
    }

    fn parse_connection_string(&self, uri: &str) -> Result<ConnectionParams> {
        let params = crate::core::device::parse_connection_uri(uri)?;
        if params.protocol != ProtocolKind::ModbusTcp {
            return Err(GatewayError::invalid_request(format!(
                "modbus adapter cannot open {} connections",
                params.protocol
            )));
        }
        Ok(params)
    }

    fn create_transport(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
        let unit = match &params.path {
            Some(path) => path.parse::<u8>().map_err(|_| {
                GatewayError::invalid_request(format!("invalid unit id in URI path: {path}"))
            })?,
            None => DEFAULT_UNIT,
        };
        Ok(Box::new(ModbusTcpTransport::new(
            params.host.clone(),
            params.port,
            unit,
            self.options.clone(),
        )))
    }
}
