//! Device patterns: recognition signatures, optimal configuration, and the
//! durable store mapping fingerprints to both.

mod model;
mod store;

pub use model::{
    now_nanos, BandwidthProfile, CommunicationProfile, DataPointMap, DevicePattern,
    DiscoverySignature, ErrorStrategy, Fingerprint, HistoricalPerformance, Metadata, PatternDatabase,
    PatternMatch, PatternStatus, ProtocolSpec, RequestTemplate, ResponsePattern, ServiceInfo,
    TimestampNs, TimingProfile, VersionRange,
};
pub use store::{PatternStats, PatternStore};
