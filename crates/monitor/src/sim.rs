//! Synthetic telemetry for the simulated transport.
//!
//! Each sample is a bounded random walk from the previous one:
//! - humidity: ±2 %/step, clamped to [0, 100]
//! - temperature: ±0.25 °C/step, clamped to [15, 35]
//! - light: ±5 %/step, clamped to [0, 100]

use chrono::{DateTime, Utc};

use crate::reading::{Reading, ValveState};

const HUMIDITY_STEP: f64 = 4.0;
const TEMPERATURE_STEP: f64 = 0.5;
const LIGHT_STEP: f64 = 10.0;

const TEMPERATURE_MIN: f64 = 15.0;
const TEMPERATURE_MAX: f64 = 35.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Climate {
    humidity: f64,
    temperature: f64,
    light: f64,
}

/// Starting point for a fresh walk.
const SEED: Climate = Climate {
    humidity: 55.0,
    temperature: 22.0,
    light: 75.0,
};

pub struct Simulator {
    rng: fastrand::Rng,
    last: Option<Climate>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::with_rng(fastrand::Rng::new())
    }
}

impl Simulator {
    pub fn with_rng(rng: fastrand::Rng) -> Self {
        Self { rng, last: None }
    }

    /// Uniform step in `[-span/2, span/2)`.
    fn step(&mut self, span: f64) -> f64 {
        (self.rng.f64() - 0.5) * span
    }

    /// Next sample. `valve` is whatever the controller currently reports,
    /// since a simulated station has no valve of its own.
    pub fn next(&mut self, valve: ValveState, now: DateTime<Utc>) -> Reading {
        let prev = self.last.unwrap_or(SEED);
        let next = Climate {
            humidity: (prev.humidity + self.step(HUMIDITY_STEP)).clamp(0.0, 100.0),
            temperature: (prev.temperature + self.step(TEMPERATURE_STEP))
                .clamp(TEMPERATURE_MIN, TEMPERATURE_MAX),
            light: (prev.light + self.step(LIGHT_STEP)).clamp(0.0, 100.0),
        };
        self.last = Some(next);
        Reading::new(next.humidity, next.temperature, next.light, valve, now)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Simulator {
        Simulator::with_rng(fastrand::Rng::with_seed(7))
    }

    #[test]
    fn first_sample_is_near_seed() {
        let r = seeded().next(ValveState::Closed, Utc::now());
        assert!((r.humidity - 55.0).abs() <= 2.0);
        assert!((r.temperature - 22.0).abs() <= 0.25);
        assert!((r.light_level - 75.0).abs() <= 5.0);
    }

    #[test]
    fn samples_stay_within_bounds() {
        let mut sim = seeded();
        for _ in 0..5000 {
            let r = sim.next(ValveState::Closed, Utc::now());
            assert!((0.0..=100.0).contains(&r.humidity));
            assert!((15.0..=35.0).contains(&r.temperature));
            assert!((0.0..=100.0).contains(&r.light_level));
        }
    }

    #[test]
    fn consecutive_samples_are_coherent() {
        let mut sim = seeded();
        let mut prev = sim.next(ValveState::Closed, Utc::now());
        for _ in 0..200 {
            let r = sim.next(ValveState::Closed, Utc::now());
            assert!((r.humidity - prev.humidity).abs() <= 2.0);
            assert!((r.temperature - prev.temperature).abs() <= 0.25);
            assert!((r.light_level - prev.light_level).abs() <= 5.0);
            prev = r;
        }
    }

    #[test]
    fn valve_is_passed_through() {
        let r = seeded().next(ValveState::Open, Utc::now());
        assert_eq!(r.valve, ValveState::Open);
    }

    #[test]
    fn same_seed_same_walk() {
        let now = Utc::now();
        let mut a = seeded();
        let mut b = seeded();
        for _ in 0..10 {
            assert_eq!(a.next(ValveState::Closed, now), b.next(ValveState::Closed, now));
        }
    }
}
