//! Register/value codec.
//!
//! Modbus transfers 16-bit registers big-endian per register. Multi-register
//! values additionally have a word order: high-word-first by default,
//! configurable per tag.

use crate::core::data::{DataType, Value};
use crate::core::error::{GatewayError, Result};
use crate::core::tag::WordOrder;

/// Assemble up to four registers into a u64 respecting word order.
fn assemble(words: &[u16], order: WordOrder) -> u64 {
    let mut acc: u64 = 0;
    match order {
        WordOrder::HighFirst => {
            for w in words {
                acc = (acc << 16) | *w as u64;
            }
        }
        WordOrder::LowFirst => {
            for w in words.iter().rev() {
                acc = (acc << 16) | *w as u64;
            }
        }
    }
    acc
}

/// Split an integer into registers respecting word order.
fn split(raw: u64, count: usize, order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = (0..count)
        .rev()
        .map(|i| ((raw >> (16 * i)) & 0xFFFF) as u16)
        .collect();
    if order == WordOrder::LowFirst {
        words.reverse();
    }
    words
}

/// Decode a word window slice into a typed value.
///
/// The slice length must equal the type's register count (strings and byte
/// arrays take whatever span the tag address covers).
pub fn decode_words(words: &[u16], data_type: DataType, order: WordOrder) -> Result<Value> {
    let expect = |n: usize| -> Result<()> {
        if words.len() != n {
            return Err(GatewayError::internal(format!(
                "{data_type} expects {n} registers, got {}",
                words.len()
            )));
        }
        Ok(())
    };

    match data_type {
        DataType::Bool => {
            expect(1)?;
            Ok(Value::Bool(words[0] != 0))
        }
        DataType::Int16 => {
            expect(1)?;
            Ok(Value::Integer(words[0] as i16 as i64))
        }
        DataType::UInt16 => {
            expect(1)?;
            Ok(Value::Integer(words[0] as i64))
        }
        DataType::Int32 => {
            expect(2)?;
            Ok(Value::Integer(assemble(words, order) as u32 as i32 as i64))
        }
        DataType::UInt32 => {
            expect(2)?;
            Ok(Value::Integer((assemble(words, order) as u32) as i64))
        }
        DataType::Float32 => {
            expect(2)?;
            Ok(Value::Float(f32::from_bits(assemble(words, order) as u32) as f64))
        }
        DataType::Int64 => {
            expect(4)?;
            Ok(Value::Integer(assemble(words, order) as i64))
        }
        DataType::UInt64 => {
            expect(4)?;
            Ok(Value::Unsigned(assemble(words, order)))
        }
        DataType::Float64 => {
            expect(4)?;
            Ok(Value::Float(f64::from_bits(assemble(words, order))))
        }
        DataType::String => {
            let bytes = words_to_bytes(words);
            let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
            Ok(Value::String(
                String::from_utf8_lossy(&bytes[..end]).into_owned(),
            ))
        }
        DataType::Bytes => Ok(Value::Bytes(words_to_bytes(words))),
    }
}

/// Decode a single bit into a typed value (coils and discrete inputs).
pub fn decode_bit(bit: bool, data_type: DataType) -> Result<Value> {
    match data_type {
        DataType::Bool => Ok(Value::Bool(bit)),
        dt if dt.is_integer() => Ok(Value::Integer(bit as i64)),
        dt => Err(GatewayError::invalid_request(format!(
            "cannot decode a bit register as {dt}"
        ))),
    }
}

/// Encode a typed value into registers for writing.
pub fn encode_words(value: &Value, data_type: DataType, order: WordOrder) -> Result<Vec<u16>> {
    let numeric = |value: &Value| -> Result<i64> {
        value.as_i64().ok_or_else(|| {
            GatewayError::invalid_request(format!("value {value:?} is not numeric"))
        })
    };

    match data_type {
        DataType::Bool => Ok(vec![if value.as_bool().unwrap_or(false) { 1 } else { 0 }]),
        DataType::Int16 | DataType::UInt16 => Ok(vec![numeric(value)? as u16]),
        DataType::Int32 | DataType::UInt32 => {
            Ok(split(numeric(value)? as u32 as u64, 2, order))
        }
        DataType::Float32 => {
            let f = value.as_f64().ok_or_else(|| {
                GatewayError::invalid_request(format!("value {value:?} is not numeric"))
            })?;
            Ok(split((f as f32).to_bits() as u64, 2, order))
        }
        DataType::Int64 => Ok(split(numeric(value)? as u64, 4, order)),
        DataType::UInt64 => {
            let raw = match value {
                Value::Unsigned(v) => *v,
                other => numeric(other)? as u64,
            };
            Ok(split(raw, 4, order))
        }
        DataType::Float64 => {
            let f = value.as_f64().ok_or_else(|| {
                GatewayError::invalid_request(format!("value {value:?} is not numeric"))
            })?;
            Ok(split(f.to_bits(), 4, order))
        }
        DataType::String => {
            let s = value.as_str().ok_or_else(|| {
                GatewayError::invalid_request("string register write needs a string value")
            })?;
            Ok(bytes_to_words(s.as_bytes()))
        }
        DataType::Bytes => match value {
            Value::Bytes(b) => Ok(bytes_to_words(b)),
            _ => Err(GatewayError::invalid_request(
                "bytes register write needs a bytes value",
            )),
        },
    }
}

/// Encode a typed value into a single coil state.
pub fn encode_bit(value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| GatewayError::invalid_request(format!("value {value:?} is not a bit")))
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_high_word_first() {
        let v = decode_words(&[0x1234, 0x5678], DataType::Int32, WordOrder::HighFirst).unwrap();
        assert_eq!(v, Value::Integer(0x1234_5678));
    }

    #[test]
    fn test_int32_low_word_first() {
        let v = decode_words(&[0x5678, 0x1234], DataType::Int32, WordOrder::LowFirst).unwrap();
        assert_eq!(v, Value::Integer(0x1234_5678));
    }

    #[test]
    fn test_negative_int16() {
        let v = decode_words(&[0xFFFE], DataType::Int16, WordOrder::HighFirst).unwrap();
        assert_eq!(v, Value::Integer(-2));
    }

    #[test]
    fn test_uint16_stays_positive() {
        let v = decode_words(&[0xFFFE], DataType::UInt16, WordOrder::HighFirst).unwrap();
        assert_eq!(v, Value::Integer(0xFFFE));
    }

    #[test]
    fn test_float32_round_trip() {
        for f in [-12.5f32, 0.0, 3.14159, 1.0e6] {
            let words = encode_words(&Value::Float(f as f64), DataType::Float32, WordOrder::HighFirst)
                .unwrap();
            let back = decode_words(&words, DataType::Float32, WordOrder::HighFirst).unwrap();
            assert_eq!(back.as_f64().unwrap() as f32, f);
        }
    }

    #[test]
    fn test_float64_round_trip_both_orders() {
        for order in [WordOrder::HighFirst, WordOrder::LowFirst] {
            let words = encode_words(&Value::Float(-2.718281828), DataType::Float64, order).unwrap();
            assert_eq!(words.len(), 4);
            let back = decode_words(&words, DataType::Float64, order).unwrap();
            assert_eq!(back.as_f64().unwrap(), -2.718281828);
        }
    }

    #[test]
    fn test_uint64_full_range() {
        let words = encode_words(
            &Value::Unsigned(u64::MAX - 1),
            DataType::UInt64,
            WordOrder::HighFirst,
        )
        .unwrap();
        let back = decode_words(&words, DataType::UInt64, WordOrder::HighFirst).unwrap();
        assert_eq!(back, Value::Unsigned(u64::MAX - 1));
    }

    #[test]
    fn test_string_trims_trailing_nul() {
        let words = bytes_to_words(b"PLC-9\0\0\0");
        let v = decode_words(&words, DataType::String, WordOrder::HighFirst).unwrap();
        assert_eq!(v, Value::String("PLC-9".into()));
    }

    #[test]
    fn test_bit_decode() {
        assert_eq!(decode_bit(true, DataType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(decode_bit(true, DataType::Int16).unwrap(), Value::Integer(1));
        assert!(decode_bit(true, DataType::Float32).is_err());
    }

    #[test]
    fn test_wrong_width_is_internal_error() {
        let err = decode_words(&[1, 2, 3], DataType::Int32, WordOrder::HighFirst).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn test_encode_rejects_incompatible_values() {
        assert!(encode_words(&Value::String("x".into()), DataType::Int16, WordOrder::HighFirst)
            .is_err());
        assert!(encode_bit(&Value::String("x".into())).is_err());
    }
}
