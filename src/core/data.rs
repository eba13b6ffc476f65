//! Data types and values for field-device points.
//!
//! The value model is protocol-agnostic: adapters decode wire registers into
//! [`Value`]s and the facade applies per-tag scaling on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::quality::Quality;

/// Data types a tag can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Single bit / boolean.
    Bool,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// Character string.
    String,
    /// Raw bytes.
    Bytes,
}

impl DataType {
    /// Number of 16-bit registers needed to hold one value of this type.
    ///
    /// Strings and byte arrays default to 8 registers (16 bytes) unless the
    /// tag address carries an explicit count.
    pub const fn register_count(&self) -> u16 {
        match self {
            Self::Bool | Self::Int16 | Self::UInt16 => 1,
            Self::Int32 | Self::UInt32 | Self::Float32 => 2,
            Self::Int64 | Self::UInt64 | Self::Float64 => 4,
            Self::String | Self::Bytes => 8,
        }
    }

    /// Check if this is an integer type (scaling truncates toward zero).
    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Int16 | Self::Int32 | Self::Int64 | Self::UInt16 | Self::UInt32 | Self::UInt64
        )
    }

    /// Check if values of this type can be scaled.
    #[inline]
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Self::Float32 | Self::Float64)
    }

    /// Short name as used in addresses and event payloads.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A protocol-agnostic value representation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value (coils, discrete inputs).
    Bool(bool),

    /// Signed integer value.
    Integer(i64),

    /// Unsigned integer value (uint64 range exceeds i64).
    Unsigned(u64),

    /// Floating-point value.
    Float(f64),

    /// String value.
    String(String),

    /// Raw bytes.
    Bytes(Vec<u8>),

    /// Null/missing value.
    #[default]
    Null,
}

impl Value {
    /// Try to get the value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Unsigned(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get the value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Unsigned(v) => i64::try_from(*v).ok(),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to get the value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Integer(v) => Some(*v != 0),
            Self::Unsigned(v) => Some(*v != 0),
            Self::Float(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    /// Try to get the value as string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Check if this is a null value.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this value's shape is compatible with a data type.
    pub fn is_compatible(&self, data_type: DataType) -> bool {
        match (self, data_type) {
            (Self::Bool(_), DataType::Bool) => true,
            (Self::Integer(_) | Self::Unsigned(_) | Self::Float(_), dt) if dt.is_numeric() => true,
            // Booleans are accepted anywhere a numeric register is expected.
            (Self::Bool(_), dt) if dt.is_numeric() => true,
            (Self::String(_), DataType::String) => true,
            (Self::Bytes(_), DataType::Bytes) => true,
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Unsigned(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// A single typed reading taken from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Name of the tag this reading belongs to.
    pub tag_name: String,

    /// The decoded and scaled value.
    pub value: Value,

    /// Wall-clock time the gateway produced the reading.
    pub timestamp: DateTime<Utc>,

    /// Reading trustworthiness.
    #[serde(default)]
    pub quality: Quality,
}

impl Reading {
    /// Create a good-quality reading stamped now.
    pub fn new(tag_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            tag_name: tag_name.into(),
            value: value.into(),
            timestamp: Utc::now(),
            quality: Quality::Good,
        }
    }

    /// Set the quality.
    #[must_use]
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_counts() {
        assert_eq!(DataType::Int16.register_count(), 1);
        assert_eq!(DataType::UInt32.register_count(), 2);
        assert_eq!(DataType::Float32.register_count(), 2);
        assert_eq!(DataType::Float64.register_count(), 4);
    }

    #[test]
    fn test_value_conversions() {
        let v = Value::from(42.5);
        assert_eq!(v.as_f64(), Some(42.5));
        assert_eq!(v.as_i64(), Some(42));

        let v = Value::from(true);
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(v.as_f64(), Some(1.0));

        let v = Value::from(u64::MAX);
        assert_eq!(v.as_i64(), None);
    }

    #[test]
    fn test_value_compatibility() {
        assert!(Value::Integer(7).is_compatible(DataType::Int16));
        assert!(Value::Float(1.5).is_compatible(DataType::Float32));
        assert!(Value::Bool(true).is_compatible(DataType::Bool));
        assert!(!Value::String("x".into()).is_compatible(DataType::Int32));
        assert!(!Value::Bool(true).is_compatible(DataType::String));
    }
}
