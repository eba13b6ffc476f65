//! Protocol probes used by the discovery scan.
//!
//! Every probe is best-effort: it either returns a partial identification of
//! the device behind an address or nothing at all. Probes never mutate
//! device state.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::core::device::ProtocolKind;
use crate::patterns::Metadata;
use crate::protocols::modbus::{ModbusOptions, ModbusTcpTransport};

use crate::core::traits::Transport;

/// EtherNet/IP encapsulation command for List Identity.
const ENIP_LIST_IDENTITY: u16 = 0x0063;

/// Partial identification produced by one probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Protocol the device answered on.
    pub protocol: ProtocolKind,

    /// Port that answered.
    pub port: u16,

    /// Manufacturer, when the probe could identify it.
    pub manufacturer: Option<String>,

    /// Model / product, when identified.
    pub model: Option<String>,

    /// Firmware revision, when identified.
    pub firmware_version: Option<String>,

    /// Device category guess.
    pub device_type: Option<String>,

    /// Identification confidence in [0, 1].
    pub confidence: f64,

    /// Probe-specific extras.
    pub metadata: Metadata,
}

/// Probe for a Modbus TCP device.
///
/// A successful TCP connect on the Modbus port is already a strong signal;
/// an FC 43 Read Device Identification answer upgrades the identification.
pub async fn probe_modbus(host: Ipv4Addr, port: u16, probe_timeout: Duration) -> Option<ProbeResult> {
    let options = ModbusOptions::default()
        .with_connect_timeout(probe_timeout)
        .with_request_timeout(probe_timeout);
    let mut transport = ModbusTcpTransport::new(host.to_string(), port, 1, options);
    if transport.connect().await.is_err() {
        return None;
    }

    let mut result = ProbeResult {
        protocol: ProtocolKind::ModbusTcp,
        port,
        manufacturer: None,
        model: None,
        firmware_version: None,
        device_type: Some("PLC".to_string()),
        confidence: 0.5,
        metadata: Metadata::new(),
    };

    // Identification is optional equipment; many devices reject FC 43.
    if let Ok(ident) = transport.read_device_identification().await {
        if ident.vendor_name.is_some() || ident.product_code.is_some() {
            result.confidence = 0.8;
        }
        result.manufacturer = ident.vendor_name;
        result.model = ident.product_code;
        result.firmware_version = ident.revision;
    }

    transport.disconnect().await.ok();
    Some(result)
}

/// Probe for an EtherNet/IP device via UDP List Identity.
pub async fn probe_ethernet_ip(
    host: Ipv4Addr,
    port: u16,
    probe_timeout: Duration,
) -> Option<ProbeResult> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect((host, port)).await.ok()?;

    socket.send(&list_identity_request()).await.ok()?;

    let mut buf = [0u8; 512];
    let len = timeout(probe_timeout, socket.recv(&mut buf)).await.ok()?.ok()?;
    let identity = parse_list_identity(&buf[..len])?;

    let mut metadata = Metadata::new();
    metadata.insert("vendor_id".into(), identity.vendor_id.into());
    metadata.insert("device_type_code".into(), identity.device_type.into());
    metadata.insert("product_code".into(), identity.product_code.into());
    metadata.insert("serial_number".into(), identity.serial_number.into());

    Some(ProbeResult {
        protocol: ProtocolKind::EthernetIp,
        port,
        manufacturer: None,
        model: identity.product_name,
        firmware_version: Some(format!("{}.{}", identity.revision_major, identity.revision_minor)),
        device_type: Some("EtherNet/IP device".to_string()),
        confidence: 0.8,
        metadata,
    })
}

/// 24-byte List Identity encapsulation request.
fn list_identity_request() -> [u8; 24] {
    let mut packet = [0u8; 24];
    packet[0..2].copy_from_slice(&ENIP_LIST_IDENTITY.to_le_bytes());
    // length, session, status, sender context and options stay zero.
    packet
}

struct EnipIdentity {
    vendor_id: u16,
    device_type: u16,
    product_code: u16,
    revision_major: u8,
    revision_minor: u8,
    serial_number: u32,
    product_name: Option<String>,
}

/// Parse a List Identity response: encapsulation header, one CPF identity
/// item, then the identity body.
fn parse_list_identity(packet: &[u8]) -> Option<EnipIdentity> {
    if packet.len() < 26 {
        return None;
    }
    let command = u16::from_le_bytes([packet[0], packet[1]]);
    if command != ENIP_LIST_IDENTITY {
        return None;
    }

    // Skip encapsulation header (24) and item count (2): item type + length.
    let body = &packet[26..];
    if body.len() < 4 {
        return None;
    }
    // item type id (2) + item length (2), then encapsulation protocol
    // version (2) and socket address (16).
    let identity = body.get(4 + 2 + 16..)?;
    if identity.len() < 15 {
        return None;
    }

    let vendor_id = u16::from_le_bytes([identity[0], identity[1]]);
    let device_type = u16::from_le_bytes([identity[2], identity[3]]);
    let product_code = u16::from_le_bytes([identity[4], identity[5]]);
    let revision_major = identity[6];
    let revision_minor = identity[7];
    // status (2 bytes) then serial number.
    let serial_number = u32::from_le_bytes([identity[10], identity[11], identity[12], identity[13]]);
    let name_len = identity[14] as usize;
    let product_name = identity
        .get(15..15 + name_len)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

    Some(EnipIdentity {
        vendor_id,
        device_type,
        product_code,
        revision_major,
        revision_minor,
        serial_number,
        product_name,
    })
}

/// Broadcast a BOOTP discover and collect responder addresses.
///
/// Purely observational: devices that answer BOOTP are reported with low
/// confidence and no identification. Environments that filter broadcast
/// traffic simply produce no results here.
pub async fn probe_bootp(probe_timeout: Duration) -> Vec<(Ipv4Addr, ProbeResult)> {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return Vec::new();
    };
    if socket.set_broadcast(true).is_err() {
        return Vec::new();
    }
    if socket
        .send_to(&bootp_discover_packet(), (Ipv4Addr::BROADCAST, 67))
        .await
        .is_err()
    {
        return Vec::new();
    }

    let mut found = Vec::new();
    let deadline = tokio::time::Instant::now() + probe_timeout;
    let mut buf = [0u8; 1024];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((_, addr))) => {
                if let std::net::IpAddr::V4(v4) = addr.ip() {
                    found.push((
                        v4,
                        ProbeResult {
                            protocol: ProtocolKind::EthernetIp,
                            port: 67,
                            manufacturer: None,
                            model: None,
                            firmware_version: None,
                            device_type: Some("BOOTP responder".to_string()),
                            confidence: 0.2,
                            metadata: Metadata::new(),
                        },
                    ));
                }
            }
            _ => break,
        }
    }
    found
}

/// Minimal BOOTP/DHCP discover packet.
fn bootp_discover_packet() -> Vec<u8> {
    let mut packet = vec![0u8; 240];
    packet[0] = 1; // op: boot request
    packet[1] = 1; // htype: ethernet
    packet[2] = 6; // hlen
    let xid = chrono::Utc::now().timestamp_subsec_nanos();
    packet[4..8].copy_from_slice(&xid.to_be_bytes());
    // Magic cookie then DHCPDISCOVER option and end marker.
    packet[236..240].copy_from_slice(&[99, 130, 83, 99]);
    packet.extend_from_slice(&[53, 1, 1, 255]);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_identity_request_layout() {
        let packet = list_identity_request();
        assert_eq!(packet.len(), 24);
        assert_eq!(u16::from_le_bytes([packet[0], packet[1]]), 0x0063);
        assert!(packet[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_list_identity() {
        // Encapsulation header.
        let mut packet = Vec::new();
        packet.extend_from_slice(&ENIP_LIST_IDENTITY.to_le_bytes());
        packet.extend_from_slice(&[0u8; 22]);
        // One CPF item: count, type 0x000C, length.
        packet.extend_from_slice(&1u16.to_le_bytes());
        packet.extend_from_slice(&0x000Cu16.to_le_bytes());
        packet.extend_from_slice(&0u16.to_le_bytes());
        // Encapsulation version + socket address.
        packet.extend_from_slice(&1u16.to_le_bytes());
        packet.extend_from_slice(&[0u8; 16]);
        // Identity: vendor, device type, product code, revision, status,
        // serial, name.
        packet.extend_from_slice(&0x01F7u16.to_le_bytes());
        packet.extend_from_slice(&0x000Eu16.to_le_bytes());
        packet.extend_from_slice(&0x0001u16.to_le_bytes());
        packet.push(2);
        packet.push(1);
        packet.extend_from_slice(&0u16.to_le_bytes());
        packet.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        packet.push(5);
        packet.extend_from_slice(b"PLC-X");
        packet.push(3); // state

        let identity = parse_list_identity(&packet).unwrap();
        assert_eq!(identity.vendor_id, 0x01F7);
        assert_eq!(identity.device_type, 0x000E);
        assert_eq!(identity.product_code, 1);
        assert_eq!(identity.revision_major, 2);
        assert_eq!(identity.revision_minor, 1);
        assert_eq!(identity.serial_number, 0xDEAD_BEEF);
        assert_eq!(identity.product_name.as_deref(), Some("PLC-X"));
    }

    #[test]
    fn test_parse_list_identity_rejects_noise() {
        assert!(parse_list_identity(&[]).is_none());
        assert!(parse_list_identity(&[0u8; 30]).is_none());
        let mut wrong_command = vec![0u8; 64];
        wrong_command[0] = 0x6F;
        assert!(parse_list_identity(&wrong_command).is_none());
    }

    #[test]
    fn test_bootp_packet_has_cookie_and_discover_option() {
        let packet = bootp_discover_packet();
        assert_eq!(packet[0], 1);
        assert_eq!(&packet[236..240], &[99, 130, 83, 99]);
        assert_eq!(&packet[240..], &[53, 1, 1, 255]);
    }

    #[tokio::test]
    async fn test_modbus_probe_needs_listener() {
        // Nothing listens on this port; the probe must give up quietly.
        let result = probe_modbus(
            Ipv4Addr::new(127, 0, 0, 1),
            1, // privileged, guaranteed closed in tests
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_none());
    }
}
