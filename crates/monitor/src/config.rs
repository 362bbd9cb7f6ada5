//! TOML config file loading, environment overrides and validation for the
//! broker connection, session behaviour and the device registry.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::history::DEFAULT_CAPACITY;
use crate::irrigation::{IrrigationSettings, WateringMode};
use crate::source::{Topics, TransportMode};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub irrigation: IrrigationConfig,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub advisory: AdvisorySettings,
    #[serde(default)]
    pub web: WebSettings,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTransport {
    Tcp,
    Ws,
    Wss,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub transport: BrokerTransport,
    /// Only used by the websocket transports.
    pub ws_path: String,
    pub data_topic: String,
    pub command_topic: String,
    pub keep_alive_sec: u64,
    pub connect_timeout_sec: u64,
    pub reconnect_period_ms: u64,
    pub client_id_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            transport: BrokerTransport::Tcp,
            ws_path: "/mqtt".to_string(),
            data_topic: "plantcare/station/sensors".to_string(),
            command_topic: "plantcare/station/commands".to_string(),
            keep_alive_sec: 30,
            connect_timeout_sec: 5,
            reconnect_period_ms: 1000,
            client_id_prefix: "plantcare".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub transport: TransportMode,
    pub default_device: Option<String>,
    pub history_capacity: usize,
    pub evaluate_every_sec: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transport: TransportMode::Simulated,
            default_device: None,
            history_capacity: DEFAULT_CAPACITY,
            evaluate_every_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IrrigationConfig {
    pub mode: WateringMode,
    pub cooldown_sec: u64,
    pub sim_cycle_sec: u64,
    pub confirm_timeout_sec: u64,
    pub completion_timeout_sec: u64,
}

impl Default for IrrigationConfig {
    fn default() -> Self {
        Self {
            mode: WateringMode::Manual,
            cooldown_sec: 30,
            sim_cycle_sec: 4,
            confirm_timeout_sec: 120,
            completion_timeout_sec: 600,
        }
    }
}

impl IrrigationConfig {
    pub fn settings(&self) -> IrrigationSettings {
        IrrigationSettings {
            cooldown: Duration::from_secs(self.cooldown_sec),
            sim_cycle: Duration::from_secs(self.sim_cycle_sec),
            confirm_timeout: Duration::from_secs(self.confirm_timeout_sec),
            completion_timeout: Duration::from_secs(self.completion_timeout_sec),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub sample_every_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            sample_every_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisorySettings {
    /// Empty means offline: built-in defaults are used for everything.
    pub base_url: String,
    pub timeout_sec: u64,
}

impl Default for AdvisorySettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// One entry of the device registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub species: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub data_topic: Option<String>,
    #[serde(default)]
    pub command_topic: Option<String>,
}

impl Device {
    /// Per-device topics, falling back to the broker-wide ones.
    pub fn topics(&self, mqtt: &MqttSettings) -> Topics {
        Topics {
            data: self
                .data_topic
                .clone()
                .unwrap_or_else(|| mqtt.data_topic.clone()),
            command: self
                .command_topic
                .clone()
                .unwrap_or_else(|| mqtt.command_topic.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `ADVISORY_URL` and `WEB_PORT`.
    /// Unparseable port values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(url) = lookup("ADVISORY_URL") {
            self.advisory.base_url = url;
        }
        if let Some(port) = lookup("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

fn is_plain_topic(topic: &str) -> bool {
    !topic.trim().is_empty() && !topic.contains('+') && !topic.contains('#')
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if m.transport != BrokerTransport::Tcp && !m.ws_path.starts_with('/') {
            errors.push(format!(
                "mqtt: ws_path '{}' must start with '/'",
                m.ws_path
            ));
        }
        if !is_plain_topic(&m.data_topic) {
            errors.push(format!(
                "mqtt: data_topic '{}' must be non-empty and contain no wildcards",
                m.data_topic
            ));
        }
        if !is_plain_topic(&m.command_topic) {
            errors.push(format!(
                "mqtt: command_topic '{}' must be non-empty and contain no wildcards",
                m.command_topic
            ));
        }
        if m.keep_alive_sec < MIN_KEEP_ALIVE_SEC {
            errors.push(format!(
                "mqtt: keep_alive_sec must be at least {MIN_KEEP_ALIVE_SEC}, got {}",
                m.keep_alive_sec
            ));
        }
        if m.connect_timeout_sec == 0 {
            errors.push("mqtt: connect_timeout_sec must be positive".to_string());
        }
        if m.reconnect_period_ms == 0 {
            errors.push("mqtt: reconnect_period_ms must be positive".to_string());
        }
        if m.client_id_prefix.trim().is_empty() {
            errors.push("mqtt: client_id_prefix is empty".to_string());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.session.history_capacity == 0 {
            errors.push("session: history_capacity must be positive".to_string());
        }
        if self.session.evaluate_every_sec == 0 {
            errors.push("session: evaluate_every_sec must be positive".to_string());
        }

        let irr = &self.irrigation;
        if irr.cooldown_sec == 0 {
            errors.push("irrigation: cooldown_sec must be positive".to_string());
        }
        if irr.sim_cycle_sec == 0 {
            errors.push("irrigation: sim_cycle_sec must be positive".to_string());
        }
        if irr.confirm_timeout_sec == 0 {
            errors.push("irrigation: confirm_timeout_sec must be positive".to_string());
        }
        if irr.completion_timeout_sec == 0 {
            errors.push("irrigation: completion_timeout_sec must be positive".to_string());
        }

        if self.simulation.sample_every_ms == 0 {
            errors.push("simulation: sample_every_ms must be positive".to_string());
        }

        let url = self.advisory.base_url.trim();
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "advisory: base_url '{url}' must start with http:// or https://"
            ));
        }
        if self.advisory.timeout_sec == 0 {
            errors.push("advisory: timeout_sec must be positive".to_string());
        }

        if self.web.port == 0 {
            errors.push("web: port must be non-zero".to_string());
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        if self.devices.is_empty() {
            errors.push("devices: at least one device must be configured".to_string());
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&d.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if d.species.trim().is_empty() {
                errors.push(format!("{}: species is empty", ctx()));
            }

            // ── Topic overrides ─────────────────────────────────
            for (field, topic) in [
                ("data_topic", &d.data_topic),
                ("command_topic", &d.command_topic),
            ] {
                if let Some(t) = topic {
                    if !is_plain_topic(t) {
                        errors.push(format!(
                            "{}: {field} '{t}' must be non-empty and contain no wildcards",
                            ctx()
                        ));
                    }
                }
            }
        }

        if let Some(default) = &self.session.default_device {
            if !self.devices.iter().any(|d| &d.id == default) {
                errors.push(format!(
                    "session: default_device '{default}' does not match any device"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, validate.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_overrides(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
