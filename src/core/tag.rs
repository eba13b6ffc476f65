//! Tag model.
//!
//! A tag is an immutable, named reference to a point on a device. The
//! `address` field is protocol-opaque at this level; the protocol adapter
//! interprets it.

use serde::{Deserialize, Serialize};

use crate::core::data::DataType;
use crate::core::error::{GatewayError, Result};

/// Word order for values spanning multiple 16-bit registers.
///
/// Bytes within a register are always big-endian on the wire; this selects
/// which register carries the most significant word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Most significant word first (default for most devices).
    #[default]
    HighFirst,
    /// Least significant word first.
    LowFirst,
}

/// A named reference to a point on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name, unique within the caller's scope. Never empty.
    pub name: String,

    /// Protocol-specific address string (e.g. `"40001"`, `"holding:100@2"`).
    pub address: String,

    /// Data type of the point.
    pub data_type: DataType,

    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Engineering units (e.g. `"kWh"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    /// Linear scaling factor; raw values are multiplied by this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling_factor: Option<f64>,

    /// Linear offset, added after scaling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,

    /// Writes through a read-only tag fail before touching the wire.
    #[serde(default)]
    pub read_only: bool,

    /// Word order for multi-register values.
    #[serde(default)]
    pub word_order: WordOrder,
}

impl Tag {
    /// Create a new tag.
    ///
    /// Fails with `InvalidRequest` when the name is empty or the scaling
    /// factor is zero (an inverse would divide by zero).
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        data_type: DataType,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(GatewayError::invalid_request("tag name must not be empty"));
        }
        let address = address.into();
        if address.is_empty() {
            return Err(GatewayError::invalid_request(format!(
                "tag '{name}' has an empty address"
            )));
        }
        Ok(Self {
            name,
            address,
            data_type,
            description: None,
            units: None,
            scaling_factor: None,
            offset: None,
            read_only: false,
            word_order: WordOrder::default(),
        })
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the engineering units.
    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Set linear scaling (`value = raw * factor + offset`).
    ///
    /// Fails with `InvalidRequest` on a zero factor.
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Result<Self> {
        if factor == 0.0 {
            return Err(GatewayError::invalid_request(format!(
                "tag '{}': scaling factor must be non-zero",
                self.name
            )));
        }
        self.scaling_factor = Some(factor);
        self.offset = Some(offset);
        Ok(self)
    }

    /// Mark the tag read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set the word order for multi-register decoding.
    #[must_use]
    pub fn with_word_order(mut self, order: WordOrder) -> Self {
        self.word_order = order;
        self
    }

    /// Apply the tag's linear scaling to a raw value.
    ///
    /// Integer data types truncate toward zero after scaling.
    pub fn apply_scaling(&self, raw: f64) -> f64 {
        let scaled = raw * self.scaling_factor.unwrap_or(1.0) + self.offset.unwrap_or(0.0);
        if self.data_type.is_integer() {
            scaled.trunc()
        } else {
            scaled
        }
    }

    /// Invert the tag's scaling: engineering value back to raw.
    ///
    /// Integer data types truncate the raw result toward zero.
    pub fn apply_inverse(&self, value: f64) -> f64 {
        let raw = (value - self.offset.unwrap_or(0.0)) / self.scaling_factor.unwrap_or(1.0);
        if self.data_type.is_integer() {
            raw.trunc()
        } else {
            raw
        }
    }

    /// Check whether the tag carries any non-identity scaling.
    pub fn is_scaled(&self) -> bool {
        self.scaling_factor.map_or(false, |f| f != 1.0) || self.offset.map_or(false, |o| o != 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            Tag::new("", "40001", DataType::Int16),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_zero_scale_rejected() {
        let tag = Tag::new("t", "40001", DataType::Int16).unwrap();
        assert!(tag.with_scaling(0.0, 1.0).is_err());
    }

    #[test]
    fn test_scaling_round_trip_float() {
        let tag = Tag::new("temp", "40001", DataType::Float32)
            .unwrap()
            .with_scaling(0.1, -40.0)
            .unwrap();
        for v in [-10.0f64, 0.0, 25.5, 121.3] {
            let raw = tag.apply_inverse(v);
            assert!((tag.apply_scaling(raw) - v).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scaling_truncates_integers() {
        let tag = Tag::new("counter", "40001", DataType::Int32)
            .unwrap()
            .with_scaling(0.3, 0.0)
            .unwrap();
        // 0.3 * 9 = 2.7 -> truncates toward zero
        assert_eq!(tag.apply_scaling(9.0), 2.0);
        assert_eq!(tag.apply_scaling(-9.0), -2.0);
    }

    #[test]
    fn test_unscaled_identity() {
        let tag = Tag::new("raw", "40001", DataType::Float64).unwrap();
        assert!(!tag.is_scaled());
        assert_eq!(tag.apply_scaling(123.25), 123.25);
        assert_eq!(tag.apply_inverse(123.25), 123.25);
    }
}
