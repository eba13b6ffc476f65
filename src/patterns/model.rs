//! Device pattern model.
//!
//! A pattern captures how to recognise a device model on the network and how
//! to talk to it optimally: discovery signature, communication profile, and
//! confidence statistics accumulated over use.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Integer nanoseconds since the Unix epoch, as persisted in the database.
pub type TimestampNs = i64;

/// Current wall clock in nanoseconds.
pub fn now_nanos() -> TimestampNs {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Free-form JSON metadata map.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A firmware version range.
///
/// Versions compare lexicographically unless `exact_version` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    /// Minimum version (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,

    /// Maximum version (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,

    /// Exact version match, overriding the bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_version: Option<String>,
}

impl VersionRange {
    /// Range matching exactly one version.
    pub fn exact(version: impl Into<String>) -> Self {
        Self {
            exact_version: Some(version.into()),
            ..Self::default()
        }
    }

    /// Check if a version falls inside the range.
    pub fn matches(&self, version: &str) -> bool {
        if let Some(exact) = &self.exact_version {
            return version == exact;
        }
        if let Some(min) = &self.min_version {
            if version < min.as_str() {
                return false;
            }
        }
        if let Some(max) = &self.max_version {
            if version > max.as_str() {
                return false;
            }
        }
        true
    }
}

/// Protocol specification for a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// Protocol name, e.g. `"modbus_tcp"`.
    pub protocol: String,

    /// Protocol variant or implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Protocol version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Default port for this protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ProtocolSpec {
    /// Spec with just a protocol name.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            variant: None,
            version: None,
            port: None,
        }
    }
}

/// Network request/response pattern used for fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePattern {
    /// Request bytes sent to the device.
    pub request_data: Vec<u8>,

    /// Regex the response must match.
    pub expected_response_pattern: String,

    /// Minimum response length.
    #[serde(default)]
    pub response_length_min: usize,

    /// Maximum response length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length_max: Option<usize>,

    /// Weight of this pattern in confidence calculations.
    #[serde(default = "default_weight")]
    pub confidence_weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Timing characteristics of device communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingProfile {
    /// Typical response time in milliseconds.
    pub typical_response_time_ms: f64,

    /// Maximum acceptable response time in milliseconds.
    pub max_response_time_ms: f64,

    /// Required delay between requests in milliseconds.
    #[serde(default)]
    pub inter_request_delay_ms: f64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: f64,
}

fn default_connection_timeout_ms() -> f64 {
    5000.0
}

/// Service discovery information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Type of service.
    pub service_type: String,

    /// Service-specific data.
    #[serde(default)]
    pub service_data: Metadata,
}

/// Template for an optimized device request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    /// Template identifier, unique within the pattern.
    pub template_id: String,

    /// Request pattern with placeholders.
    pub request_pattern: String,

    /// Expected response pattern.
    pub expected_response_pattern: String,

    /// Whether the request can be batched with others.
    #[serde(default)]
    pub batch_compatible: bool,

    /// Priority (1 = high, 10 = low).
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    1
}

/// A known data point on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointMap {
    /// Tag name.
    pub tag_name: String,

    /// Device address.
    pub address: String,

    /// Data type name.
    pub data_type: String,

    /// Scaling factor.
    #[serde(default = "default_scale")]
    pub scale_factor: f64,

    /// Engineering unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

/// Error-handling strategy for the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStrategy {
    /// Number of retries.
    pub retry_count: u32,

    /// Delay between retries in milliseconds.
    pub retry_delay_ms: f64,

    /// Fallback strategy name.
    pub fallback_strategy: String,

    /// Error codes safe to ignore for this device.
    #[serde(default)]
    pub error_codes_to_ignore: Vec<String>,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay_ms: 1000.0,
            fallback_strategy: "skip".to_string(),
            error_codes_to_ignore: Vec::new(),
        }
    }
}

/// Bandwidth requirements of the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthProfile {
    /// Sustained bytes per second.
    pub bytes_per_second: f64,

    /// Burst capacity in bytes.
    pub burst_capacity: f64,

    /// Concurrent connections the device tolerates.
    #[serde(default = "default_concurrent")]
    pub concurrent_connections: u32,
}

fn default_concurrent() -> u32 {
    1
}

/// Discovery signature used for pattern matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySignature {
    /// Network response patterns.
    #[serde(default)]
    pub network_responses: Vec<ResponsePattern>,

    /// Timing profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing_characteristics: Option<TimingProfile>,

    /// Service discovery data.
    #[serde(default)]
    pub service_discovery_data: Vec<ServiceInfo>,
}

/// Communication profile for optimal device interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationProfile {
    /// Optimal polling rate in Hz.
    #[serde(default = "default_polling_rate")]
    pub optimal_polling_rate: f64,

    /// Request templates.
    #[serde(default)]
    pub request_templates: Vec<RequestTemplate>,

    /// Data point mappings.
    #[serde(default)]
    pub data_point_mappings: Vec<DataPointMap>,

    /// Error handling strategy.
    #[serde(default)]
    pub error_handling_strategy: ErrorStrategy,
}

fn default_polling_rate() -> f64 {
    1.0
}

impl Default for CommunicationProfile {
    fn default() -> Self {
        Self {
            optimal_polling_rate: default_polling_rate(),
            request_templates: Vec::new(),
            data_point_mappings: Vec::new(),
            error_handling_strategy: ErrorStrategy::default(),
        }
    }
}

/// Historical performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPerformance {
    /// Average response time in milliseconds.
    pub avg_response_time: f64,

    /// Reliability score in [0, 1].
    pub reliability_score: f64,

    /// Bandwidth requirements.
    pub bandwidth_requirements: BandwidthProfile,

    /// Last update timestamp in nanoseconds.
    pub last_updated: TimestampNs,
}

/// Lifecycle status of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStatus {
    /// In active use.
    #[default]
    Active,
    /// Superseded, kept for matching only.
    Deprecated,
    /// Unverified, low-trust.
    Experimental,
    /// Retired, not matched.
    Archived,
}

/// Observable attributes of a discovered device used to key into the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Protocol name, e.g. `"modbus_tcp"`.
    pub protocol: String,

    /// Host address.
    pub host: String,

    /// Port the device answered on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Manufacturer, if identified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    /// Model, if identified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Firmware version, if identified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Device category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    /// Probe-specific extras (vendor ids, serial numbers, timing).
    #[serde(default)]
    pub metadata: Metadata,
}

/// Complete device pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePattern {
    // Identity
    /// Unique pattern identifier.
    pub pattern_id: String,
    /// Manufacturer identifier.
    pub manufacturer_id: String,
    /// Product family.
    pub product_family: String,
    /// Model number.
    pub model_number: String,
    /// Supported firmware versions.
    #[serde(default)]
    pub firmware_version_range: VersionRange,
    /// Protocol specification.
    pub protocol_variant: ProtocolSpec,

    // Discovery
    /// Discovery signature.
    #[serde(default)]
    pub discovery_signature: DiscoverySignature,

    // Communication
    /// Communication profile.
    #[serde(default)]
    pub communication_profile: CommunicationProfile,

    // Performance
    /// Historical performance data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_performance: Option<HistoricalPerformance>,

    // Confidence
    /// Pattern confidence in [0, 1].
    #[serde(default = "default_confidence")]
    pub pattern_confidence: f64,
    /// Times the pattern was used.
    #[serde(default)]
    pub usage_count: u64,
    /// Last verification timestamp in nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<TimestampNs>,
    /// Contributor reputation in [0, 1].
    #[serde(default = "default_confidence")]
    pub contributor_reputation: f64,

    // Metadata
    /// Lifecycle status.
    #[serde(default)]
    pub status: PatternStatus,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_confidence() -> f64 {
    0.5
}

impl DevicePattern {
    /// Create a pattern with default profiles and medium confidence.
    pub fn new(
        pattern_id: impl Into<String>,
        manufacturer_id: impl Into<String>,
        product_family: impl Into<String>,
        model_number: impl Into<String>,
        protocol_variant: ProtocolSpec,
    ) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            manufacturer_id: manufacturer_id.into(),
            product_family: product_family.into(),
            model_number: model_number.into(),
            firmware_version_range: VersionRange::default(),
            protocol_variant,
            discovery_signature: DiscoverySignature::default(),
            communication_profile: CommunicationProfile::default(),
            historical_performance: None,
            pattern_confidence: default_confidence(),
            usage_count: 0,
            last_verified: None,
            contributor_reputation: default_confidence(),
            status: PatternStatus::Active,
            tags: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Set the confidence, clamped to [0, 1].
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.pattern_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Set the firmware version range.
    #[must_use]
    pub fn with_firmware_range(mut self, range: VersionRange) -> Self {
        self.firmware_version_range = range;
        self
    }

    /// Clamp the confidence scalars into [0, 1].
    pub fn clamp_confidences(&mut self) {
        self.pattern_confidence = self.pattern_confidence.clamp(0.0, 1.0);
        self.contributor_reputation = self.contributor_reputation.clamp(0.0, 1.0);
    }

    /// Check hard compatibility with a fingerprint.
    ///
    /// A protocol mismatch fails regardless of every other field, as does a
    /// firmware version outside the supported range.
    pub fn is_compatible(&self, fingerprint: &Fingerprint) -> bool {
        if fingerprint.protocol != self.protocol_variant.protocol {
            return false;
        }
        if let Some(firmware) = &fingerprint.firmware_version {
            if !self.firmware_version_range.matches(firmware) {
                return false;
            }
        }
        true
    }

    /// Weighted match confidence against a fingerprint, in [0, 1].
    ///
    /// The pattern's own confidence contributes with weight 0.3; exact
    /// manufacturer, model and protocol matches contribute 0.3, 0.2 and 0.2.
    /// The sum is normalized over the weights that applied.
    pub fn match_confidence(&self, fingerprint: &Fingerprint) -> f64 {
        let mut confidence = self.pattern_confidence * 0.3;
        let mut total_weight = 0.3;

        if fingerprint.manufacturer.as_deref() == Some(self.manufacturer_id.as_str()) {
            confidence += 0.3;
            total_weight += 0.3;
        }
        if fingerprint.model.as_deref() == Some(self.model_number.as_str()) {
            confidence += 0.2;
            total_weight += 0.2;
        }
        if fingerprint.protocol == self.protocol_variant.protocol {
            confidence += 0.2;
            total_weight += 0.2;
        }

        (confidence / total_weight).clamp(0.0, 1.0)
    }
}

/// One ranked match out of [`PatternDatabase::find`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    /// The matched pattern (a copy owned by the caller).
    pub pattern: DevicePattern,

    /// Match confidence in [0, 1].
    pub confidence: f64,
}

/// The persisted pattern database document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDatabase {
    /// Patterns indexed by pattern id.
    #[serde(default)]
    pub patterns: BTreeMap<String, DevicePattern>,

    /// Document format version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Last update, nanoseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<TimestampNs>,

    /// Database metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for PatternDatabase {
    fn default() -> Self {
        Self {
            patterns: BTreeMap::new(),
            version: default_version(),
            last_updated: None,
            metadata: Metadata::new(),
        }
    }
}

impl PatternDatabase {
    /// Insert or replace a pattern, clamping its confidences.
    pub fn add(&mut self, mut pattern: DevicePattern) {
        pattern.clamp_confidences();
        self.patterns.insert(pattern.pattern_id.clone(), pattern);
    }

    /// Remove a pattern, reporting whether it existed.
    pub fn remove(&mut self, pattern_id: &str) -> bool {
        self.patterns.remove(pattern_id).is_some()
    }

    /// Look up a pattern by id.
    pub fn get(&self, pattern_id: &str) -> Option<&DevicePattern> {
        self.patterns.get(pattern_id)
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Check whether the database is empty.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Ranked matches for a fingerprint at or above `min_confidence`.
    ///
    /// Incompatible patterns are filtered before scoring. Ordering is
    /// deterministic: confidence descending, then usage count descending,
    /// then pattern id ascending.
    pub fn find(&self, fingerprint: &Fingerprint, min_confidence: f64) -> Vec<PatternMatch> {
        let mut matches: Vec<PatternMatch> = self
            .patterns
            .values()
            .filter(|p| p.is_compatible(fingerprint))
            .filter_map(|p| {
                let confidence = p.match_confidence(fingerprint);
                (confidence >= min_confidence).then(|| PatternMatch {
                    pattern: p.clone(),
                    confidence,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.pattern.usage_count.cmp(&a.pattern.usage_count))
                .then_with(|| a.pattern.pattern_id.cmp(&b.pattern.pattern_id))
        });
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(manufacturer: Option<&str>, model: Option<&str>, protocol: &str) -> Fingerprint {
        Fingerprint {
            protocol: protocol.to_string(),
            host: "10.0.0.9".to_string(),
            port: Some(502),
            manufacturer: manufacturer.map(str::to_string),
            model: model.map(str::to_string),
            ..Fingerprint::default()
        }
    }

    fn pattern(id: &str, manufacturer: &str, model: &str) -> DevicePattern {
        DevicePattern::new(
            id,
            manufacturer,
            "family",
            model,
            ProtocolSpec::new("modbus_tcp"),
        )
    }

    #[test]
    fn test_version_range() {
        let range = VersionRange {
            min_version: Some("1.2".into()),
            max_version: Some("2.0".into()),
            exact_version: None,
        };
        assert!(range.matches("1.2"));
        assert!(range.matches("1.9"));
        assert!(range.matches("2.0"));
        assert!(!range.matches("1.1"));
        assert!(!range.matches("2.1"));

        let exact = VersionRange::exact("3.1.4");
        assert!(exact.matches("3.1.4"));
        assert!(!exact.matches("3.1.5"));
    }

    #[test]
    fn test_protocol_mismatch_is_incompatible() {
        let p = pattern("p1", "Acme", "M1");
        let fp = fingerprint(Some("Acme"), Some("M1"), "opcua");
        assert!(!p.is_compatible(&fp));
        // Protocol mismatch wins even with perfect manufacturer/model.
        assert!(p.match_confidence(&fp) < 1.0);
    }

    #[test]
    fn test_firmware_out_of_range_is_incompatible() {
        let p = pattern("p1", "Acme", "M1").with_firmware_range(VersionRange {
            min_version: Some("2.0".into()),
            max_version: None,
            exact_version: None,
        });
        let mut fp = fingerprint(Some("Acme"), Some("M1"), "modbus_tcp");
        fp.firmware_version = Some("1.9".into());
        assert!(!p.is_compatible(&fp));
        fp.firmware_version = Some("2.1".into());
        assert!(p.is_compatible(&fp));
    }

    #[test]
    fn test_full_match_confidence() {
        let p = pattern("p1", "Acme", "M1").with_confidence(0.9);
        let fp = fingerprint(Some("Acme"), Some("M1"), "modbus_tcp");
        // (0.9*0.3 + 0.3 + 0.2 + 0.2) / 1.0 = 0.97
        let c = p.match_confidence(&fp);
        assert!((c - 0.97).abs() < 1e-9);
    }

    #[test]
    fn test_find_ordering_is_deterministic() {
        let mut db = PatternDatabase::default();
        let mut a = pattern("alpha", "Acme", "M1").with_confidence(0.9);
        a.usage_count = 5;
        let mut b = pattern("beta", "Acme", "M1").with_confidence(0.9);
        b.usage_count = 9;
        let c = pattern("gamma", "Other", "M2").with_confidence(0.9);
        db.add(a);
        db.add(b);
        db.add(c);

        let fp = fingerprint(Some("Acme"), Some("M1"), "modbus_tcp");
        let first = db.find(&fp, 0.0);
        let second = db.find(&fp, 0.0);
        assert_eq!(first, second);

        // Equal confidence: higher usage first, then id.
        assert_eq!(first[0].pattern.pattern_id, "beta");
        assert_eq!(first[1].pattern.pattern_id, "alpha");
        assert_eq!(first[2].pattern.pattern_id, "gamma");
        assert!(first[1].confidence > first[2].confidence);
    }

    #[test]
    fn test_min_confidence_filters() {
        let mut db = PatternDatabase::default();
        db.add(pattern("weak", "Acme", "M1").with_confidence(0.1));
        let fp = fingerprint(None, None, "modbus_tcp");
        assert!(db.find(&fp, 0.9).is_empty());
        assert_eq!(db.find(&fp, 0.0).len(), 1);
    }

    #[test]
    fn test_add_clamps_confidence() {
        let mut db = PatternDatabase::default();
        let mut p = pattern("p", "Acme", "M1");
        p.pattern_confidence = 7.5;
        p.contributor_reputation = -1.0;
        db.add(p);
        let stored = db.get("p").unwrap();
        assert_eq!(stored.pattern_confidence, 1.0);
        assert_eq!(stored.contributor_reputation, 0.0);
    }
}
