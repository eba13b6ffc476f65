//! Device facade.
//!
//! Maps a caller's tag set onto protocol addressing, coalesces contiguous
//! reads into windows, issues one pooled wire request per window, and hands
//! back typed, scaled readings. Failed windows never produce bad-quality
//! readings: their tags are absent from the result and an `ErrorOccurred`
//! event is emitted instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::core::data::{Reading, Value};
use crate::core::device::{ConnectionParams, DeviceInfo};
use crate::core::error::{GatewayError, Result};
use crate::core::state::ConnectionState;
use crate::core::tag::Tag;
use crate::core::traits::{ProtocolAdapter, RawValue, Transport};
use crate::events::{Event, EventBus};
use crate::pool::ConnectionPool;
use crate::protocols::modbus::codec;

use super::plan::{plan_read_windows, plan_write_runs, TagBinding, Window};

/// Result of a batched write.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Number of tags written successfully.
    pub success_count: usize,

    /// Tags whose window failed, with the error message.
    pub failures: Vec<(String, String)>,
}

impl WriteOutcome {
    /// Check if every tag was written.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Protocol-agnostic read/write facade over one device.
pub struct Device {
    info: DeviceInfo,
    adapter: Arc<dyn ProtocolAdapter>,
    pool: ConnectionPool,
    bus: Arc<EventBus>,
}

impl Device {
    /// Create a facade for `info`, speaking through `adapter` and `pool`.
    ///
    /// Fails with `InvalidRequest` when the adapter's protocol does not
    /// match the device's.
    pub fn new(
        info: DeviceInfo,
        adapter: Arc<dyn ProtocolAdapter>,
        pool: ConnectionPool,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        if adapter.protocol() != info.protocol {
            return Err(GatewayError::invalid_request(format!(
                "adapter speaks {} but device {} uses {}",
                adapter.protocol(),
                info.device_id,
                info.protocol
            )));
        }
        Ok(Self {
            info,
            adapter,
            pool,
            bus,
        })
    }

    /// The device's identity record.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Identity plus the live connection state of the device's transport.
    pub fn get_info(&self) -> (DeviceInfo, ConnectionState) {
        (self.info.clone(), self.state())
    }

    /// Live connection state (default unit), `Disconnected` when nothing is
    /// pooled.
    pub fn state(&self) -> ConnectionState {
        let key = self
            .params_for_unit(crate::protocols::modbus::DEFAULT_UNIT)
            .pool_key();
        self.pool
            .entry_state(&key)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn params_for_unit(&self, unit: u8) -> ConnectionParams {
        ConnectionParams {
            protocol: self.info.protocol,
            host: self.info.host.clone(),
            port: self.info.effective_port(),
            path: Some(unit.to_string()),
        }
    }

    fn source_for_unit(&self, unit: u8) -> String {
        format!(
            "{}:{}:{}/{}",
            self.info.protocol,
            self.info.host,
            self.info.effective_port(),
            unit
        )
    }

    /// Read a set of tags, returning one reading per successful tag.
    ///
    /// All addresses are validated before any I/O. Tags in a window whose
    /// wire request failed are omitted from the map; an `ErrorOccurred`
    /// event per failed window names them.
    pub async fn read(&self, tags: &[Tag]) -> Result<HashMap<String, Reading>> {
        let bindings = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| TagBinding::bind(i, tag))
            .collect::<Result<Vec<_>>>()?;

        let windows = plan_read_windows(bindings);
        let mut readings = HashMap::with_capacity(tags.len());

        for window in windows {
            let source = self.source_for_unit(window.unit);
            match self.read_window(&window).await {
                Ok(raw) => {
                    self.split_window(tags, &window, &raw, &source, &mut readings);
                }
                Err(err) => {
                    let names: Vec<&str> =
                        window.tags.iter().map(|b| tags[b.index].name.as_str()).collect();
                    tracing::warn!(source = %source, window = %window.address(), error = %err, "window read failed");
                    self.bus.emit(Event::error(
                        &source,
                        &err,
                        json!({
                            "operation": "read",
                            "window": window.address(),
                            "count": window.count,
                            "tags": names,
                        }),
                    ));
                }
            }
        }

        Ok(readings)
    }

    async fn read_window(&self, window: &Window) -> Result<Vec<RawValue>> {
        let params = self.params_for_unit(window.unit);
        let key = params.pool_key();
        let adapter = self.adapter.clone();
        let factory_params = params.clone();
        let mut lease = self
            .pool
            .acquire(&key, move || async move {
                adapter.create_transport(&factory_params)
            })
            .await?;

        let result = lease
            .transport()
            .read_raw(&window.address(), window.count)
            .await;
        if let Err(err) = &result {
            lease.fault(err);
        }
        lease.release().await;
        result
    }

    fn split_window(
        &self,
        tags: &[Tag],
        window: &Window,
        raw: &[RawValue],
        source: &str,
        readings: &mut HashMap<String, Reading>,
    ) {
        for binding in &window.tags {
            let tag = &tags[binding.index];
            let rel = window.relative_offset(binding);
            let decoded = if binding.address.kind.is_bit() {
                raw.get(rel)
                    .and_then(RawValue::as_bit)
                    .ok_or_else(|| GatewayError::internal("window shorter than planned"))
                    .and_then(|bit| codec::decode_bit(bit, tag.data_type))
            } else {
                let span = raw
                    .get(rel..rel + binding.width as usize)
                    .ok_or_else(|| GatewayError::internal("window shorter than planned"));
                span.and_then(|span| {
                    let words: Vec<u16> = span.iter().filter_map(RawValue::as_word).collect();
                    if words.len() != binding.width as usize {
                        return Err(GatewayError::internal("bit values in a word window"));
                    }
                    codec::decode_words(&words, tag.data_type, tag.word_order)
                })
            };

            match decoded.map(|value| self.scale(tag, value)) {
                Ok(value) => {
                    let json_value = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
                    self.bus.emit(Event::data_received(
                        source,
                        &tag.address,
                        json_value,
                        tag.data_type.as_str(),
                    ));
                    readings.insert(tag.name.clone(), Reading::new(tag.name.clone(), value));
                }
                Err(err) => {
                    self.bus.emit(Event::error(
                        source,
                        &err,
                        json!({ "operation": "decode", "tag": tag.name }),
                    ));
                }
            }
        }
    }

    fn scale(&self, tag: &Tag, value: Value) -> Value {
        if !tag.is_scaled() || !tag.data_type.is_numeric() {
            return value;
        }
        match value.as_f64() {
            Some(raw) => {
                let scaled = tag.apply_scaling(raw);
                if tag.data_type.is_integer() {
                    Value::Integer(scaled as i64)
                } else {
                    Value::Float(scaled)
                }
            }
            None => value,
        }
    }

    /// Write values to a set of tags.
    ///
    /// Read-only tags, unwritable register types, and incompatible values
    /// are all rejected with `InvalidRequest` before any wire traffic.
    /// Windows are then independent: a failed window is recorded in the
    /// outcome and later windows are still attempted.
    pub async fn write(&self, values: &[(Tag, Value)]) -> Result<WriteOutcome> {
        // Static pre-conditions, strictly before any I/O.
        for (tag, value) in values {
            if tag.read_only {
                return Err(GatewayError::invalid_request(format!(
                    "tag '{}' is read-only",
                    tag.name
                )));
            }
            if !value.is_compatible(tag.data_type) {
                return Err(GatewayError::invalid_request(format!(
                    "value {value:?} is not compatible with {} tag '{}'",
                    tag.data_type, tag.name
                )));
            }
        }

        let mut bindings = Vec::with_capacity(values.len());
        let mut encoded: Vec<Vec<RawValue>> = Vec::with_capacity(values.len());
        for (i, (tag, value)) in values.iter().enumerate() {
            let binding = TagBinding::bind(i, tag)?;
            if binding.address.kind.is_read_only() {
                return Err(GatewayError::invalid_request(format!(
                    "tag '{}' addresses read-only {} registers",
                    tag.name, binding.address.kind
                )));
            }
            encoded.push(self.encode(tag, value, &binding)?);
            bindings.push(binding);
        }

        let runs = plan_write_runs(bindings);
        let mut outcome = WriteOutcome::default();

        for run in runs {
            let source = self.source_for_unit(run.unit);
            let image: Vec<RawValue> = run
                .tags
                .iter()
                .flat_map(|b| encoded[b.index].iter().copied())
                .collect();

            match self.write_run(&run, &image).await {
                Ok(()) => outcome.success_count += run.tags.len(),
                Err(err) => {
                    let names: Vec<&str> =
                        run.tags.iter().map(|b| values[b.index].0.name.as_str()).collect();
                    tracing::warn!(source = %source, run = %run.address(), error = %err, "window write failed");
                    self.bus.emit(Event::error(
                        &source,
                        &err,
                        json!({
                            "operation": "write",
                            "window": run.address(),
                            "tags": names,
                        }),
                    ));
                    let message = err.to_string();
                    for binding in &run.tags {
                        outcome
                            .failures
                            .push((values[binding.index].0.name.clone(), message.clone()));
                    }
                }
            }
        }

        Ok(outcome)
    }

    fn encode(&self, tag: &Tag, value: &Value, binding: &TagBinding) -> Result<Vec<RawValue>> {
        if binding.address.kind.is_bit() {
            return Ok(vec![RawValue::Bit(codec::encode_bit(value)?)]);
        }

        let wire_value = if tag.is_scaled() && tag.data_type.is_numeric() {
            let engineering = value.as_f64().ok_or_else(|| {
                GatewayError::invalid_request(format!(
                    "scaled tag '{}' needs a numeric value",
                    tag.name
                ))
            })?;
            let raw = tag.apply_inverse(engineering);
            if tag.data_type.is_integer() {
                Value::Integer(raw as i64)
            } else {
                Value::Float(raw)
            }
        } else {
            value.clone()
        };

        let mut words = codec::encode_words(&wire_value, tag.data_type, tag.word_order)?;
        if words.len() > binding.width as usize {
            return Err(GatewayError::invalid_request(format!(
                "value for tag '{}' spans {} registers, address allows {}",
                tag.name,
                words.len(),
                binding.width
            )));
        }
        words.resize(binding.width as usize, 0);
        Ok(words.into_iter().map(RawValue::Word).collect())
    }

    async fn write_run(&self, run: &Window, image: &[RawValue]) -> Result<()> {
        let params = self.params_for_unit(run.unit);
        let key = params.pool_key();
        let adapter = self.adapter.clone();
        let factory_params = params.clone();
        let mut lease = self
            .pool
            .acquire(&key, move || async move {
                adapter.create_transport(&factory_params)
            })
            .await?;

        let result = lease.transport().write_raw(&run.address(), image).await;
        if let Err(err) = &result {
            lease.fault(err);
        }
        lease.release().await;
        result
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.info.device_id)
            .field("endpoint", &self.info.connection_string())
            .finish()
    }
}
