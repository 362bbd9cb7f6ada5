use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Valve state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    Open,
    Closed,
    Unknown,
}

impl ValveState {
    /// Lenient parse of the station's valve field. Anything that is not
    /// "open" or "unknown" reads as closed.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "unknown" => Self::Unknown,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One normalised environmental sample.
///
/// Always build through [`Reading::new`]: humidity and light are clamped to
/// `[0, 100]` there. Temperature is stored as received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub humidity: f64,
    pub temperature: f64,
    pub light_level: f64,
    pub valve: ValveState,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        humidity: f64,
        temperature: f64,
        light_level: f64,
        valve: ValveState,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            humidity: clamp_percent(humidity),
            temperature: if temperature.is_finite() { temperature } else { 0.0 },
            light_level: clamp_percent(light_level),
            valve,
            captured_at,
        }
    }
}

fn clamp_percent(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_humidity_and_light() {
        let r = Reading::new(140.0, 22.0, -5.0, ValveState::Closed, Utc::now());
        assert_eq!(r.humidity, 100.0);
        assert_eq!(r.light_level, 0.0);
    }

    #[test]
    fn new_leaves_temperature_unclamped() {
        let r = Reading::new(50.0, 48.5, 50.0, ValveState::Closed, Utc::now());
        assert_eq!(r.temperature, 48.5);
    }

    #[test]
    fn new_replaces_non_finite_values() {
        let r = Reading::new(f64::NAN, f64::INFINITY, f64::NAN, ValveState::Open, Utc::now());
        assert_eq!(r.humidity, 0.0);
        assert_eq!(r.temperature, 0.0);
        assert_eq!(r.light_level, 0.0);
    }

    #[test]
    fn valve_from_str_lossy() {
        assert_eq!(ValveState::from_str_lossy("open"), ValveState::Open);
        assert_eq!(ValveState::from_str_lossy(" OPEN "), ValveState::Open);
        assert_eq!(ValveState::from_str_lossy("closed"), ValveState::Closed);
        assert_eq!(ValveState::from_str_lossy("unknown"), ValveState::Unknown);
        assert_eq!(ValveState::from_str_lossy("ajar"), ValveState::Closed);
        assert_eq!(ValveState::from_str_lossy(""), ValveState::Closed);
    }

    #[test]
    fn reading_serializes_camel_case() {
        let r = Reading::new(40.0, 21.0, 60.0, ValveState::Open, Utc::now());
        let json = serde_json::to_value(r).unwrap();
        assert_eq!(json["lightLevel"], 60.0);
        assert_eq!(json["valve"], "open");
        assert!(json.get("capturedAt").is_some());
    }
}
