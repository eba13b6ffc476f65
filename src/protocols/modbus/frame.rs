//! Modbus TCP framing.
//!
//! Encodes and decodes MBAP-framed PDUs: a 7-byte header (transaction id,
//! protocol id 0, length, unit id) followed by the function-code PDU.
//! Exception responses (function | 0x80, one exception byte) are mapped to
//! `Protocol` errors carrying the device's code verbatim.

use bytes::{Buf, BufMut, BytesMut};

use crate::core::error::{GatewayError, Result};

use super::address::RegisterKind;

/// MBAP protocol identifier (always zero for Modbus TCP).
pub const PROTOCOL_ID: u16 = 0;

/// Size of the MBAP header in bytes.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal MBAP frame (header + 253-byte PDU).
pub const MAX_FRAME_LEN: usize = MBAP_HEADER_LEN + 253;

/// Encapsulated Interface Transport function code (FC 43).
pub const FC_READ_DEVICE_ID: u8 = 0x2B;

/// MEI type for Read Device Identification.
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Decoded MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier echoed by the server.
    pub transaction_id: u16,
    /// Remaining byte count (unit id + PDU).
    pub length: u16,
    /// Slave unit id.
    pub unit: u8,
}

/// Frame a PDU into a full MBAP request.
pub fn encode_frame(transaction_id: u16, unit: u8, pdu: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(pdu.len() as u16 + 1);
    buf.put_u8(unit);
    buf.put_slice(pdu);
    buf
}

/// Decode and validate an MBAP header.
pub fn decode_header(mut header: &[u8]) -> Result<MbapHeader> {
    if header.len() < MBAP_HEADER_LEN {
        return Err(GatewayError::framing("short MBAP header"));
    }
    let transaction_id = header.get_u16();
    let protocol_id = header.get_u16();
    let length = header.get_u16();
    let unit = header.get_u8();

    if protocol_id != PROTOCOL_ID {
        return Err(GatewayError::framing(format!(
            "unexpected protocol id {protocol_id}"
        )));
    }
    if length < 2 || length as usize > MAX_FRAME_LEN - 6 {
        return Err(GatewayError::framing(format!(
            "implausible MBAP length {length}"
        )));
    }
    Ok(MbapHeader {
        transaction_id,
        length,
        unit,
    })
}

// === Request PDU builders ===

/// Read request for any register type (FC 01/02/03/04).
pub fn read_request(kind: RegisterKind, offset: u16, count: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(kind.read_function());
    pdu.extend_from_slice(&offset.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

/// Write Single Coil (FC 05).
pub fn write_single_coil(offset: u16, on: bool) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(0x05);
    pdu.extend_from_slice(&offset.to_be_bytes());
    pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    pdu
}

/// Write Single Register (FC 06).
pub fn write_single_register(offset: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(0x06);
    pdu.extend_from_slice(&offset.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Write Multiple Coils (FC 15). Bits are packed LSB-first.
pub fn write_multiple_coils(offset: u16, bits: &[bool]) -> Vec<u8> {
    let byte_count = bits.len().div_ceil(8);
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(0x0F);
    pdu.extend_from_slice(&offset.to_be_bytes());
    pdu.extend_from_slice(&(bits.len() as u16).to_be_bytes());
    pdu.push(byte_count as u8);
    let mut packed = vec![0u8; byte_count];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    pdu.extend_from_slice(&packed);
    pdu
}

/// Write Multiple Registers (FC 16).
pub fn write_multiple_registers(offset: u16, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(0x10);
    pdu.extend_from_slice(&offset.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Read Device Identification, basic object set (FC 43 / MEI 14).
pub fn read_device_id_request() -> Vec<u8> {
    vec![FC_READ_DEVICE_ID, MEI_READ_DEVICE_ID, 0x01, 0x00]
}

// === Response PDU parsers ===

/// Human-readable text for a Modbus exception code.
pub fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

/// Check the response function code, surfacing exception responses.
fn check_function(pdu: &[u8], request_fc: u8) -> Result<()> {
    let Some(&fc) = pdu.first() else {
        return Err(GatewayError::framing("empty response PDU"));
    };
    if fc == request_fc | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(GatewayError::exception(code, exception_message(code)));
    }
    if fc != request_fc {
        return Err(GatewayError::framing(format!(
            "response function {fc:#04x} does not match request {request_fc:#04x}"
        )));
    }
    Ok(())
}

/// Parse an FC 01/02 response into `count` bits.
pub fn parse_read_bits(pdu: &[u8], kind: RegisterKind, count: u16) -> Result<Vec<bool>> {
    check_function(pdu, kind.read_function())?;
    let expected_bytes = (count as usize).div_ceil(8);
    if pdu.len() < 2 || pdu[1] as usize != expected_bytes || pdu.len() < 2 + expected_bytes {
        return Err(GatewayError::framing("bit response byte count mismatch"));
    }
    let data = &pdu[2..2 + expected_bytes];
    Ok((0..count as usize)
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// Parse an FC 03/04 response into `count` registers.
pub fn parse_read_words(pdu: &[u8], kind: RegisterKind, count: u16) -> Result<Vec<u16>> {
    check_function(pdu, kind.read_function())?;
    let expected_bytes = count as usize * 2;
    if pdu.len() < 2 || pdu[1] as usize != expected_bytes || pdu.len() < 2 + expected_bytes {
        return Err(GatewayError::framing("word response byte count mismatch"));
    }
    Ok(pdu[2..2 + expected_bytes]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Validate a write acknowledgement (FC 05/06/15/16 echo).
pub fn parse_write_ack(pdu: &[u8], request_fc: u8) -> Result<()> {
    check_function(pdu, request_fc)?;
    if pdu.len() < 5 {
        return Err(GatewayError::framing("short write acknowledgement"));
    }
    Ok(())
}

/// Basic device-identification objects (FC 43 / MEI 14).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentification {
    /// Object 0x00.
    pub vendor_name: Option<String>,
    /// Object 0x01.
    pub product_code: Option<String>,
    /// Object 0x02.
    pub revision: Option<String>,
}

/// Parse a Read Device Identification response.
pub fn parse_device_id(pdu: &[u8]) -> Result<DeviceIdentification> {
    check_function(pdu, FC_READ_DEVICE_ID)?;
    // fc, mei type, read code, conformity, more follows, next id, count
    if pdu.len() < 7 || pdu[1] != MEI_READ_DEVICE_ID {
        return Err(GatewayError::framing("malformed device identification response"));
    }
    let object_count = pdu[6] as usize;
    let mut ident = DeviceIdentification::default();
    let mut cursor = 7;
    for _ in 0..object_count {
        if cursor + 2 > pdu.len() {
            return Err(GatewayError::framing("truncated device identification object"));
        }
        let id = pdu[cursor];
        let len = pdu[cursor + 1] as usize;
        cursor += 2;
        if cursor + len > pdu.len() {
            return Err(GatewayError::framing("truncated device identification object"));
        }
        let text = String::from_utf8_lossy(&pdu[cursor..cursor + len]).into_owned();
        cursor += len;
        match id {
            0x00 => ident.vendor_name = Some(text),
            0x01 => ident.product_code = Some(text),
            0x02 => ident.revision = Some(text),
            _ => {}
        }
    }
    Ok(ident)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let pdu = read_request(RegisterKind::Holding, 0, 2);
        let frame = encode_frame(0x1234, 1, &pdu);
        assert_eq!(
            frame.as_ref(),
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02]
        );
    }

    #[test]
    fn test_decode_header_round_trip() {
        let pdu = read_request(RegisterKind::Input, 10, 4);
        let frame = encode_frame(7, 3, &pdu);
        let header = decode_header(&frame[..MBAP_HEADER_LEN]).unwrap();
        assert_eq!(header.transaction_id, 7);
        assert_eq!(header.unit, 3);
        assert_eq!(header.length as usize, pdu.len() + 1);
    }

    #[test]
    fn test_decode_header_rejects_bad_protocol_id() {
        let bad = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01];
        let err = decode_header(&bad).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol {
                kind: crate::core::error::ProtocolErrorKind::Framing,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_words() {
        // FC03, 4 bytes, 0x1234 0x5678
        let pdu = [0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        let words = parse_read_words(&pdu, RegisterKind::Holding, 2).unwrap();
        assert_eq!(words, vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_parse_bits_lsb_first() {
        // FC01, 1 byte, bits 0 and 2 set
        let pdu = [0x01, 0x01, 0b0000_0101];
        let bits = parse_read_bits(&pdu, RegisterKind::Coil, 3).unwrap();
        assert_eq!(bits, vec![true, false, true]);
    }

    #[test]
    fn test_exception_response_maps_code_verbatim() {
        let pdu = [0x83, 0x02];
        let err = parse_read_words(&pdu, RegisterKind::Holding, 1).unwrap_err();
        match err {
            GatewayError::Protocol { kind, code, message } => {
                assert_eq!(kind, crate::core::error::ProtocolErrorKind::ExceptionResponse);
                assert_eq!(code, 2);
                assert_eq!(message, "illegal data address");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncated_word_response_is_framing_error() {
        let pdu = [0x03, 0x04, 0x12, 0x34];
        let err = parse_read_words(&pdu, RegisterKind::Holding, 2).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol {
                kind: crate::core::error::ProtocolErrorKind::Framing,
                ..
            }
        ));
    }

    #[test]
    fn test_write_multiple_coils_packing() {
        let pdu = write_multiple_coils(8, &[true, true, false, true]);
        assert_eq!(pdu, vec![0x0F, 0x00, 0x08, 0x00, 0x04, 0x01, 0b0000_1011]);
    }

    #[test]
    fn test_write_multiple_registers_layout() {
        let pdu = write_multiple_registers(5, &[0xAABB, 0xCCDD]);
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x05, 0x00, 0x02, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]
        );
    }

    #[test]
    fn test_parse_device_id_objects() {
        let mut pdu = vec![FC_READ_DEVICE_ID, MEI_READ_DEVICE_ID, 0x01, 0x01, 0x00, 0x00, 0x02];
        pdu.extend_from_slice(&[0x00, 0x05]);
        pdu.extend_from_slice(b"Acme ");
        pdu.extend_from_slice(&[0x01, 0x04]);
        pdu.extend_from_slice(b"PLC9");
        let ident = parse_device_id(&pdu).unwrap();
        assert_eq!(ident.vendor_name.as_deref(), Some("Acme "));
        assert_eq!(ident.product_code.as_deref(), Some("PLC9"));
        assert_eq!(ident.revision, None);
    }
}
