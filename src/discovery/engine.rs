//! Pattern-enhanced discovery engine.
//!
//! Scans a CIDR range with bounded concurrency, fingerprints every device a
//! probe identifies, and queries the pattern store: a match is the fast path
//! (the device is enriched from stored knowledge and the pattern's usage is
//! recorded), a miss is the slow path (optionally learning a new pattern
//! when the identification is strong). Results stream lazily, one device at
//! a time, and the scan can be cancelled.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::StreamExt;
use ipnetwork::Ipv4Network;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::device::{DeviceInfo, ProtocolKind};
use crate::core::error::{GatewayError, Result};
use crate::events::{Event, EventBus};
use crate::patterns::{
    DevicePattern, Fingerprint, PatternStore, ProtocolSpec, VersionRange,
};

use super::probe::{self, ProbeResult};

/// Protocols the scanner probes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeProtocol {
    /// Modbus TCP connect + optional FC 43 identification.
    Modbus,
    /// EtherNet/IP UDP List Identity.
    EthernetIp,
    /// BOOTP/DHCP broadcast observation.
    Bootp,
}

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// CIDR range to scan, e.g. `"192.168.1.0/24"`.
    pub network: String,

    /// Per-host probe deadline.
    pub probe_timeout: Duration,

    /// Maximum concurrently probed hosts.
    pub max_concurrent: usize,

    /// Probes to run.
    pub protocols: Vec<ProbeProtocol>,

    /// Modbus TCP port to probe.
    pub modbus_port: u16,

    /// EtherNet/IP UDP port to probe.
    pub enip_port: u16,

    /// Pattern database path (used when no store is supplied).
    pub pattern_store_path: PathBuf,

    /// Minimum confidence for a pattern match (fast path).
    pub pattern_confidence_threshold: f64,

    /// Learn new patterns from well-identified slow-path devices.
    pub enable_pattern_learning: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network: "192.168.1.0/24".to_string(),
            probe_timeout: Duration::from_secs(2),
            max_concurrent: 50,
            protocols: vec![
                ProbeProtocol::Modbus,
                ProbeProtocol::EthernetIp,
                ProbeProtocol::Bootp,
            ],
            modbus_port: 502,
            enip_port: 44818,
            pattern_store_path: PathBuf::from("patterns.json"),
            pattern_confidence_threshold: 0.7,
            enable_pattern_learning: true,
        }
    }
}

impl DiscoveryConfig {
    /// Parse and validate the CIDR range.
    pub fn parse_network(&self) -> Result<Ipv4Network> {
        self.network.parse::<Ipv4Network>().map_err(|err| {
            GatewayError::invalid_request(format!("invalid network range '{}': {err}", self.network))
        })
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        self.parse_network()?;
        if self.max_concurrent == 0 {
            return Err(GatewayError::invalid_request(
                "max_concurrent must be >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.pattern_confidence_threshold) {
            return Err(GatewayError::invalid_request(
                "pattern_confidence_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Which discovery path produced a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPath {
    /// A stored pattern matched; configuration was applied from it.
    Fast,
    /// No pattern matched; the device carries only probe data.
    Slow,
}

impl DiscoveryPath {
    /// Name as used in event payloads.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

/// One discovered device with its pattern outcome.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Identity assembled from probe and pattern data.
    pub info: DeviceInfo,

    /// Fingerprint used against the pattern store.
    pub fingerprint: Fingerprint,

    /// Fast or slow path.
    pub path: DiscoveryPath,

    /// Whether a pattern's configuration was applied.
    pub pattern_applied: bool,

    /// Matched (or learned) pattern id.
    pub pattern_id: Option<String>,

    /// Confidence of the pattern match.
    pub match_confidence: Option<f64>,

    /// Optimal polling rate copied from the matched pattern, in Hz.
    pub optimal_polling_rate: Option<f64>,

    /// Identification confidence reported by the probe.
    pub probe_confidence: f64,
}

/// Lazy, finite, non-restartable sequence of discovered devices.
///
/// Dropping the stream (or calling [`cancel`](Self::cancel)) aborts
/// outstanding probes promptly; events emitted up to that point stay valid.
pub struct DeviceStream {
    rx: mpsc::Receiver<DiscoveredDevice>,
    handle: JoinHandle<()>,
}

impl DeviceStream {
    /// Next discovered device, or `None` when the scan is exhausted.
    pub async fn next_device(&mut self) -> Option<DiscoveredDevice> {
        self.rx.recv().await
    }

    /// Abort the scan. Already-queued devices can still be drained.
    pub fn cancel(&mut self) {
        self.handle.abort();
        self.rx.close();
    }
}

impl futures::Stream for DeviceStream {
    type Item = DiscoveredDevice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Network scanner with pattern fast-path.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    network: Ipv4Network,
    store: Arc<PatternStore>,
    bus: Arc<EventBus>,
}

impl DiscoveryEngine {
    /// Create an engine, opening the pattern store at the configured path.
    pub fn new(config: DiscoveryConfig, bus: Arc<EventBus>) -> Result<Self> {
        let store = Arc::new(PatternStore::open(&config.pattern_store_path)?);
        Self::with_store(config, store, bus)
    }

    /// Create an engine over an existing pattern store.
    pub fn with_store(
        config: DiscoveryConfig,
        store: Arc<PatternStore>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        let network = config.parse_network()?;
        Ok(Self {
            config,
            network,
            store,
            bus,
        })
    }

    /// The pattern store this engine consults.
    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    /// Host addresses inside the configured range (network and broadcast
    /// addresses excluded for prefixes shorter than /31).
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let network = self.network;
        if network.prefix() >= 31 {
            return network.iter().collect();
        }
        network
            .iter()
            .filter(|ip| *ip != network.network() && *ip != network.broadcast())
            .collect()
    }

    /// Start the scan, returning the lazy device stream.
    pub fn start(&self) -> DeviceStream {
        let (tx, rx) = mpsc::channel(16);
        let hosts = self.hosts();
        let config = self.config.clone();
        let store = self.store.clone();
        let bus = self.bus.clone();

        let handle = tokio::spawn(async move {
            let probe_hosts = futures::stream::iter(hosts.into_iter())
                .map(|host| {
                    let config = &config;
                    async move { (host, probe_host(host, config).await) }
                })
                .buffer_unordered(config.max_concurrent.max(1));
            futures::pin_mut!(probe_hosts);

            while let Some((host, probes)) = probe_hosts.next().await {
                for probe in probes {
                    let device = process_probe(host, probe, &config, &store, &bus);
                    if tx.send(device).await.is_err() {
                        // Receiver dropped: the caller cancelled.
                        return;
                    }
                }
            }

            if config.protocols.contains(&ProbeProtocol::Bootp) {
                for (host, probe) in probe::probe_bootp(config.probe_timeout).await {
                    let device = process_probe(host, probe, &config, &store, &bus);
                    if tx.send(device).await.is_err() {
                        return;
                    }
                }
            }
        });

        DeviceStream { rx, handle }
    }

    /// Run the scan to completion and collect every device.
    pub async fn run_to_completion(&self) -> Vec<DiscoveredDevice> {
        let mut stream = self.start();
        let mut devices = Vec::new();
        while let Some(device) = stream.next_device().await {
            devices.push(device);
        }
        devices
    }
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("network", &self.config.network)
            .field("protocols", &self.config.protocols)
            .finish()
    }
}

/// Run the configured per-host probes.
async fn probe_host(host: Ipv4Addr, config: &DiscoveryConfig) -> Vec<ProbeResult> {
    let mut results = Vec::new();
    for protocol in &config.protocols {
        match protocol {
            ProbeProtocol::Modbus => {
                if let Some(result) =
                    probe::probe_modbus(host, config.modbus_port, config.probe_timeout).await
                {
                    results.push(result);
                }
            }
            ProbeProtocol::EthernetIp => {
                if let Some(result) =
                    probe::probe_ethernet_ip(host, config.enip_port, config.probe_timeout).await
                {
                    results.push(result);
                }
            }
            // BOOTP is broadcast-wide, handled once per scan.
            ProbeProtocol::Bootp => {}
        }
    }
    results
}

/// Fingerprint, pattern-match and enrich one probe result.
fn process_probe(
    host: Ipv4Addr,
    probe: ProbeResult,
    config: &DiscoveryConfig,
    store: &PatternStore,
    bus: &EventBus,
) -> DiscoveredDevice {
    let mut info = DeviceInfo::new(
        format!("{}:{host}:{}", probe.protocol, probe.port),
        probe.protocol,
        host.to_string(),
    )
    .with_port(probe.port);
    info.manufacturer = probe.manufacturer.clone();
    info.model = probe.model.clone();
    info.firmware_version = probe.firmware_version.clone();
    info.device_type = probe.device_type.clone();
    info.metadata = probe.metadata.clone();

    let fingerprint = Fingerprint {
        protocol: probe.protocol.as_str().to_string(),
        host: host.to_string(),
        port: Some(probe.port),
        manufacturer: probe.manufacturer.clone(),
        model: probe.model.clone(),
        firmware_version: probe.firmware_version.clone(),
        device_type: probe.device_type.clone(),
        metadata: probe.metadata.clone(),
    };

    let source = format!("discovery:{host}");
    let matches = store.find(&fingerprint, config.pattern_confidence_threshold);

    if let Some(best) = matches.into_iter().next() {
        // Fast path: fill the gaps from stored knowledge.
        let pattern = &best.pattern;
        if info.manufacturer.is_none() && pattern.manufacturer_id != "unknown" {
            info.manufacturer = Some(pattern.manufacturer_id.clone());
        }
        if info.model.is_none() && pattern.model_number != "unknown" {
            info.model = Some(pattern.model_number.clone());
        }
        let polling_rate = pattern.communication_profile.optimal_polling_rate;
        info.metadata
            .insert("pattern_id".into(), pattern.pattern_id.clone().into());
        info.metadata
            .insert("optimal_polling_rate".into(), polling_rate.into());
        info.metadata.insert("fast_path_applied".into(), true.into());

        if let Err(err) = store.update_usage(&pattern.pattern_id, true) {
            tracing::warn!(pattern = %pattern.pattern_id, error = %err, "usage update failed");
        }

        tracing::info!(host = %host, pattern = %pattern.pattern_id, confidence = best.confidence, "fast path match");
        bus.emit(Event::device_discovered(
            &source,
            serde_json::to_value(&info).unwrap_or(json!({})),
            DiscoveryPath::Fast.as_str(),
        ));

        return DiscoveredDevice {
            info,
            fingerprint,
            path: DiscoveryPath::Fast,
            pattern_applied: true,
            pattern_id: Some(pattern.pattern_id.clone()),
            match_confidence: Some(best.confidence),
            optimal_polling_rate: Some(polling_rate),
            probe_confidence: probe.confidence,
        };
    }

    // Slow path.
    tracing::debug!(host = %host, protocol = %probe.protocol, "no pattern match");
    bus.emit(Event::device_discovered(
        &source,
        serde_json::to_value(&info).unwrap_or(json!({})),
        DiscoveryPath::Slow.as_str(),
    ));

    let mut learned_id = None;
    if config.enable_pattern_learning
        && probe.confidence > 0.7
        && info.manufacturer.is_some()
        && info.model.is_some()
    {
        match learn_pattern(&fingerprint, store) {
            Ok(id) => {
                info.metadata.insert("learned_pattern_id".into(), id.clone().into());
                learned_id = Some(id);
            }
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "pattern learning failed");
            }
        }
    }

    DiscoveredDevice {
        info,
        fingerprint,
        path: DiscoveryPath::Slow,
        pattern_applied: false,
        pattern_id: learned_id,
        match_confidence: None,
        optimal_polling_rate: None,
        probe_confidence: probe.confidence,
    }
}

/// Create and store a new pattern from a well-identified device.
fn learn_pattern(fingerprint: &Fingerprint, store: &PatternStore) -> Result<String> {
    let manufacturer = fingerprint.manufacturer.as_deref().unwrap_or("unknown");
    let model = fingerprint.model.as_deref().unwrap_or("unknown");
    let pattern_id = format!("{manufacturer}_{model}_{}", fingerprint.protocol)
        .to_lowercase()
        .replace([' ', '.'], "_");

    let mut spec = ProtocolSpec::new(fingerprint.protocol.clone());
    spec.port = fingerprint.port;

    let mut pattern = DevicePattern::new(
        pattern_id.clone(),
        manufacturer,
        "unknown",
        model,
        spec,
    )
    .with_confidence(0.5);
    if let Some(firmware) = &fingerprint.firmware_version {
        pattern.firmware_version_range = VersionRange::exact(firmware.clone());
    }
    pattern.contributor_reputation = 0.8;
    pattern.metadata.insert(
        "learned_from".into(),
        serde_json::to_value(fingerprint).unwrap_or(json!({})),
    );
    pattern
        .metadata
        .insert("learning_timestamp".into(), crate::patterns::now_nanos().into());

    store.add(pattern)?;
    tracing::info!(pattern = %pattern_id, "learned new pattern");
    Ok(pattern_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn store() -> (tempfile::TempDir, Arc<PatternStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PatternStore::open(dir.path().join("patterns.json")).unwrap());
        (dir, store)
    }

    fn probe(manufacturer: Option<&str>, model: Option<&str>, confidence: f64) -> ProbeResult {
        ProbeResult {
            protocol: ProtocolKind::ModbusTcp,
            port: 502,
            manufacturer: manufacturer.map(str::to_string),
            model: model.map(str::to_string),
            firmware_version: None,
            device_type: Some("PLC".to_string()),
            confidence,
            metadata: crate::patterns::Metadata::new(),
        }
    }

    fn config(dir: &tempfile::TempDir) -> DiscoveryConfig {
        DiscoveryConfig {
            network: "192.168.1.0/30".to_string(),
            pattern_store_path: dir.path().join("patterns.json"),
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = DiscoveryConfig::default();
        cfg.validate().unwrap();

        cfg.network = "not-a-network".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(GatewayError::InvalidRequest(_))
        ));

        cfg.network = "10.0.0.0/24".to_string();
        cfg.pattern_confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_host_enumeration_skips_network_and_broadcast() {
        let (_dir, store) = store();
        let cfg = DiscoveryConfig {
            network: "10.1.0.0/29".to_string(),
            ..DiscoveryConfig::default()
        };
        let engine =
            DiscoveryEngine::with_store(cfg, store, Arc::new(EventBus::new())).unwrap();
        let hosts = engine.hosts();
        assert_eq!(hosts.len(), 6);
        assert!(!hosts.contains(&Ipv4Addr::new(10, 1, 0, 0)));
        assert!(!hosts.contains(&Ipv4Addr::new(10, 1, 0, 7)));

        let single = DiscoveryEngine::with_store(
            DiscoveryConfig {
                network: "127.0.0.1/32".to_string(),
                ..DiscoveryConfig::default()
            },
            engine.store().clone(),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        assert_eq!(single.hosts(), vec![Ipv4Addr::new(127, 0, 0, 1)]);
    }

    #[test]
    fn test_fast_path_applies_pattern_and_counts_usage() {
        let (dir, store) = store();
        let mut pattern = DevicePattern::new(
            "manux_modely_modbus_tcp",
            "ManufacturerX",
            "PLC",
            "ModelY",
            ProtocolSpec::new("modbus_tcp"),
        )
        .with_confidence(0.9);
        pattern.communication_profile.optimal_polling_rate = 4.0;
        store.add(pattern).unwrap();

        let bus = Arc::new(EventBus::new());
        let cfg = config(&dir);
        let device = process_probe(
            Ipv4Addr::new(192, 168, 1, 10),
            probe(Some("ManufacturerX"), Some("ModelY"), 0.8),
            &cfg,
            &store,
            &bus,
        );

        assert_eq!(device.path, DiscoveryPath::Fast);
        assert!(device.pattern_applied);
        assert_eq!(device.pattern_id.as_deref(), Some("manux_modely_modbus_tcp"));
        assert_eq!(device.optimal_polling_rate, Some(4.0));
        assert_eq!(
            device.info.metadata["optimal_polling_rate"],
            serde_json::json!(4.0)
        );

        // Usage statistics were recorded.
        let stored = store.get("manux_modely_modbus_tcp").unwrap();
        assert_eq!(stored.usage_count, 1);

        let events = bus.recent(10, Some(EventKind::DeviceDiscovered));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["path"], "fast");
    }

    #[test]
    fn test_fast_path_fills_missing_identity() {
        let (dir, store) = store();
        store
            .add(
                DevicePattern::new(
                    "p",
                    "Acme",
                    "PLC",
                    "M1",
                    ProtocolSpec::new("modbus_tcp"),
                )
                .with_confidence(1.0),
            )
            .unwrap();

        let bus = Arc::new(EventBus::new());
        let mut cfg = config(&dir);
        // Anonymous probe: only the pattern's own confidence and the protocol
        // weight contribute, so lower the bar.
        cfg.pattern_confidence_threshold = 0.5;
        let device = process_probe(
            Ipv4Addr::new(192, 168, 1, 11),
            probe(None, None, 0.5),
            &cfg,
            &store,
            &bus,
        );

        assert_eq!(device.path, DiscoveryPath::Fast);
        assert_eq!(device.info.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(device.info.model.as_deref(), Some("M1"));
    }

    #[test]
    fn test_slow_path_learns_strong_identifications() {
        let (dir, store) = store();
        let bus = Arc::new(EventBus::new());
        let cfg = config(&dir);

        let device = process_probe(
            Ipv4Addr::new(192, 168, 1, 12),
            probe(Some("Acme Corp"), Some("PLC.9"), 0.8),
            &cfg,
            &store,
            &bus,
        );

        assert_eq!(device.path, DiscoveryPath::Slow);
        assert!(!device.pattern_applied);
        let learned_id = device.pattern_id.expect("pattern learned");
        assert_eq!(learned_id, "acme_corp_plc_9_modbus_tcp");

        let learned = store.get(&learned_id).unwrap();
        assert_eq!(learned.pattern_confidence, 0.5);
        assert_eq!(learned.manufacturer_id, "Acme Corp");
        assert_eq!(learned.contributor_reputation, 0.8);

        let events = bus.recent(10, Some(EventKind::DeviceDiscovered));
        assert_eq!(events[0].data["path"], "slow");
    }

    #[test]
    fn test_slow_path_skips_weak_identifications() {
        let (dir, store) = store();
        let bus = Arc::new(EventBus::new());
        let cfg = config(&dir);

        // Low confidence: no learning.
        let device = process_probe(
            Ipv4Addr::new(192, 168, 1, 13),
            probe(Some("Acme"), Some("M1"), 0.5),
            &cfg,
            &store,
            &bus,
        );
        assert!(device.pattern_id.is_none());

        // Missing model: no learning either.
        let device = process_probe(
            Ipv4Addr::new(192, 168, 1, 13),
            probe(Some("Acme"), None, 0.9),
            &cfg,
            &store,
            &bus,
        );
        assert!(device.pattern_id.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_learning_disabled() {
        let (dir, store) = store();
        let bus = Arc::new(EventBus::new());
        let cfg = DiscoveryConfig {
            enable_pattern_learning: false,
            ..config(&dir)
        };

        let device = process_probe(
            Ipv4Addr::new(192, 168, 1, 14),
            probe(Some("Acme"), Some("M1"), 0.9),
            &cfg,
            &store,
            &bus,
        );
        assert!(device.pattern_id.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_scan_finds_local_modbus_listener() {
        use tokio::net::TcpListener;

        // A bare TCP listener is enough for the connect-level probe; FC 43
        // identification simply fails and the device stays anonymous.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                // Hold the socket open until the probe is done with it.
                tokio::spawn(async move {
                    let _socket = socket;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let (dir, store) = store();
        let bus = Arc::new(EventBus::new());
        let cfg = DiscoveryConfig {
            network: "127.0.0.1/32".to_string(),
            protocols: vec![ProbeProtocol::Modbus],
            modbus_port: port,
            probe_timeout: Duration::from_millis(500),
            pattern_store_path: dir.path().join("patterns.json"),
            ..DiscoveryConfig::default()
        };
        let engine = DiscoveryEngine::with_store(cfg, store, bus).unwrap();

        let devices = engine.run_to_completion().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].info.host, "127.0.0.1");
        assert_eq!(devices[0].info.port, Some(port));
        assert_eq!(devices[0].path, DiscoveryPath::Slow);
    }

    #[tokio::test]
    async fn test_scan_of_dead_range_is_empty_and_cancellable() {
        let (dir, store) = store();
        let bus = Arc::new(EventBus::new());
        let cfg = DiscoveryConfig {
            // TEST-NET-1: guaranteed unroutable, probes just time out.
            network: "192.0.2.0/30".to_string(),
            protocols: vec![ProbeProtocol::Modbus],
            probe_timeout: Duration::from_millis(100),
            pattern_store_path: dir.path().join("patterns.json"),
            ..DiscoveryConfig::default()
        };
        let engine = DiscoveryEngine::with_store(cfg, store, bus).unwrap();

        let mut stream = engine.start();
        stream.cancel();
        assert!(stream.next_device().await.is_none());
    }
}
