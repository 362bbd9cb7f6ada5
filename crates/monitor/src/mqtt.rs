use chrono::{DateTime, Utc};
use rumqttc::{MqttOptions, Transport};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::{BrokerTransport, MqttSettings};
use crate::reading::{Reading, ValveState};

/// Full-scale value of the station's 12-bit light sensor. Higher raw values
/// mean less light.
pub(crate) const LIGHT_RAW_MAX: f64 = 4095.0;

/// Token published on the command topic to open the station's valve.
pub(crate) const WATER_NOW: &str = "WATER_NOW";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a json object")]
    NotAnObject,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    WaterNow,
}

impl Command {
    pub(crate) fn token(self) -> &'static str {
        match self {
            Self::WaterNow => WATER_NOW,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Convert a raw light sensor value into a light percentage.
pub(crate) fn light_from_raw(raw: f64) -> f64 {
    ((1.0 - raw / LIGHT_RAW_MAX) * 100.0).clamp(0.0, 100.0)
}

/// Parse a station telemetry frame into a [`Reading`].
///
/// Accepts `humidity`/`hum` and `temperature`/`temp`. Missing or malformed
/// numeric fields read as 0, a missing light value reads as fully dark and a
/// missing valve reads as closed. Only a payload that is not a JSON object is
/// rejected.
pub(crate) fn parse_frame(payload: &[u8], captured_at: DateTime<Utc>) -> Result<Reading, FrameError> {
    let value: Value = serde_json::from_slice(payload)?;
    let obj = value.as_object().ok_or(FrameError::NotAnObject)?;

    let humidity = number_field(obj, &["humidity", "hum"]).unwrap_or(0.0);
    let temperature = number_field(obj, &["temperature", "temp"]).unwrap_or(0.0);
    let light_raw = number_field(obj, &["light"]).unwrap_or(LIGHT_RAW_MAX);
    let valve = match first_present(obj, &["valve"]) {
        Some(Value::String(s)) => ValveState::from_str_lossy(s),
        _ => ValveState::Closed,
    };

    Ok(Reading::new(
        humidity,
        temperature,
        light_from_raw(light_raw),
        valve,
        captured_at,
    ))
}

/// First key whose value is present and not null.
fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    first_present(obj, keys).and_then(coerce_number)
}

/// Numbers pass through, numeric strings are parsed. Firmware sometimes
/// sends readings as strings.
fn coerce_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

// ---------------------------------------------------------------------------
// Client options
// ---------------------------------------------------------------------------

/// Per-session client id: configured prefix plus a random hex suffix.
pub(crate) fn client_id(prefix: &str) -> String {
    format!("{prefix}_{:08x}", fastrand::u32(..))
}

pub(crate) fn mqtt_options(cfg: &MqttSettings, client_id: String) -> MqttOptions {
    let broker = match cfg.transport {
        BrokerTransport::Tcp => cfg.host.clone(),
        BrokerTransport::Ws => format!("ws://{}:{}{}", cfg.host, cfg.port, cfg.ws_path),
        BrokerTransport::Wss => format!("wss://{}:{}{}", cfg.host, cfg.port, cfg.ws_path),
    };

    let mut opts = MqttOptions::new(client_id, broker, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    opts.set_clean_session(true);

    match cfg.transport {
        BrokerTransport::Tcp => {}
        BrokerTransport::Ws => {
            opts.set_transport(Transport::Ws);
        }
        BrokerTransport::Wss => {
            opts.set_transport(Transport::wss_with_default_config());
        }
    }

    opts
}

// ===========================================================================
// Tests
// ===========================================================================
