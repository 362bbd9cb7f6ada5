//! Climate simulator for the station emulator.
//!
//! Models a plant's surroundings the way the physical station sees them:
//! - Temperature and air humidity as mean-reverting random walks
//! - Light following a diurnal cycle (dark at night) plus sensor noise
//! - Humidity rising while the valve is open
//! - Light reported on the sensor's raw 12-bit scale (higher = darker)

use std::fmt;

/// Full scale of the light sensor.
pub const LIGHT_RAW_MAX: f64 = 4095.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured climates selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild room climate. Nothing adverse, so a monitor only waters on the
    /// base interval.
    Temperate,
    /// Hot, bright and dry. Every stress penalty applies on the monitor side.
    Heatwave,
    /// Shaded corner: low light, cool, humid.
    Dim,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" => Self::Heatwave,
            "dim" => Self::Dim,
            _ => Self::Temperate,
        }
    }

    fn params(self) -> Params {
        match self {
            Self::Temperate => Params {
                temperature: 22.0,
                humidity: 55.0,
                light_peak: 75.0,
            },
            Self::Heatwave => Params {
                temperature: 31.0,
                humidity: 24.0,
                light_peak: 95.0,
            },
            Self::Dim => Params {
                temperature: 19.0,
                humidity: 62.0,
                light_peak: 25.0,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperate => write!(f, "temperate"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Dim => write!(f, "dim"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Params {
    /// Centre of the temperature walk (°C).
    temperature: f64,
    /// Centre of the humidity walk (%).
    humidity: f64,
    /// Light at solar noon (%).
    light_peak: f64,
}

const MEAN_REVERSION: f64 = 0.1;
const TEMPERATURE_SIGMA: f64 = 0.3;
const HUMIDITY_SIGMA: f64 = 1.0;
const LIGHT_NOISE_SIGMA: f64 = 2.0;
/// Humidity gained per sample while the valve is open.
const WATERING_HUMIDITY_GAIN: f64 = 3.0;

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One sensor sample in the station's native units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub humidity: f64,
    pub temperature: f64,
    pub light_raw: u16,
}

pub struct ClimateSim {
    rng: fastrand::Rng,
    params: Params,
    humidity: f64,
    temperature: f64,
    day_length_s: f64,
    watering: bool,
}

impl ClimateSim {
    /// `day_length_s` is one full day/night cycle. Use something short
    /// (600) to watch the light swing during development.
    pub fn new(scenario: Scenario, day_length_s: f64, rng: fastrand::Rng) -> Self {
        let params = scenario.params();
        Self {
            rng,
            params,
            humidity: params.humidity,
            temperature: params.temperature,
            day_length_s: day_length_s.max(1.0),
            watering: false,
        }
    }

    /// Inform the simulator whether the valve is currently open.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    /// Advance the climate by one sample. `elapsed_s` is time since the
    /// emulator started; it only drives the day/night phase.
    pub fn sample(&mut self, elapsed_s: f64) -> Sample {
        let p = self.params;

        let pull_t = MEAN_REVERSION * (p.temperature - self.temperature);
        self.temperature += pull_t + gaussian(&mut self.rng, 0.0, TEMPERATURE_SIGMA);

        let pull_h = MEAN_REVERSION * (p.humidity - self.humidity);
        let wet = if self.watering { WATERING_HUMIDITY_GAIN } else { 0.0 };
        self.humidity = (self.humidity + pull_h + wet + gaussian(&mut self.rng, 0.0, HUMIDITY_SIGMA))
            .clamp(0.0, 100.0);

        // Daylight is the positive half of the sine; night reads fully dark.
        let phase = 2.0 * std::f64::consts::PI * elapsed_s / self.day_length_s;
        let daylight = phase.sin().max(0.0);
        let light_pct = (p.light_peak * daylight + gaussian(&mut self.rng, 0.0, LIGHT_NOISE_SIGMA))
            .clamp(0.0, 100.0);

        Sample {
            humidity: self.humidity,
            temperature: self.temperature,
            light_raw: light_pct_to_raw(light_pct),
        }
    }
}

/// Inverse of the monitor's conversion: 100 % light is raw 0.
pub fn light_pct_to_raw(pct: f64) -> u16 {
    ((1.0 - pct.clamp(0.0, 100.0) / 100.0) * LIGHT_RAW_MAX).round() as u16
}

// ===========================================================================
// Tests
// ===========================================================================
