//! Thirst estimation: a pure function of the latest reading, the care
//! profile and the time since the last watering.
//!
//! ```text
//! factor   = max(0.5, 1.0 - 0.2·[temp > 28] - 0.1·[light > 80] - 0.1·[humidity < 30])
//! interval = base_interval · factor
//! thirsty  = hours_since_watering > interval
//! stress   = 1.0 - factor
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::care::{CareProfile, DEFAULT_WATERING_INTERVAL_HOURS};
use crate::history::History;

/// Hours-since-watering used when the plant has never been watered.
pub const NEVER_WATERED_HOURS: f64 = 9999.0;

/// Stress scores above this are reported as elevated.
pub const ELEVATED_STRESS: f64 = 0.2;

const FACTOR_FLOOR: f64 = 0.5;

const HOT_ABOVE_C: f64 = 28.0;
const HOT_PENALTY: f64 = 0.2;
const BRIGHT_ABOVE_PCT: f64 = 80.0;
const BRIGHT_PENALTY: f64 = 0.1;
const DRY_AIR_BELOW_PCT: f64 = 30.0;
const DRY_AIR_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThirstReason {
    IntervalReached,
    TranspirationStress,
}

impl fmt::Display for ThirstReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntervalReached => write!(f, "interval threshold reached"),
            Self::TranspirationStress => write!(f, "transpiration stress detected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThirstAssessment {
    pub profile_loaded: bool,
    pub is_thirsty: bool,
    pub reason: Option<ThirstReason>,
    /// `1 - factor`, in `[0, 0.5]`.
    pub stress_score: f64,
    pub stress_factor: f64,
    /// `stress_score` above [`ELEVATED_STRESS`].
    pub elevated: bool,
    /// `None` when the plant has never been watered.
    pub hours_since_watering: Option<f64>,
    pub base_interval_hours: f64,
    pub adjusted_interval_hours: f64,
}

impl ThirstAssessment {
    /// Assessment while no care profile is loaded: needs unknown, never thirsty.
    fn unknown(hours_since_watering: Option<f64>) -> Self {
        Self {
            profile_loaded: false,
            is_thirsty: false,
            reason: None,
            stress_score: 0.0,
            stress_factor: 1.0,
            elevated: false,
            hours_since_watering,
            base_interval_hours: DEFAULT_WATERING_INTERVAL_HOURS,
            adjusted_interval_hours: DEFAULT_WATERING_INTERVAL_HOURS,
        }
    }
}

impl Default for ThirstAssessment {
    fn default() -> Self {
        Self::unknown(None)
    }
}

pub fn hours_since(last_watered_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<f64> {
    last_watered_at.map(|at| (now - at).num_milliseconds() as f64 / 3_600_000.0)
}

/// Multiplicative stress factor from the newest reading in `history`. With
/// no reading there is nothing adverse to penalise.
pub fn stress_factor(history: &History) -> f64 {
    let Some(r) = history.latest() else {
        return 1.0;
    };
    let mut factor = 1.0;
    if r.temperature > HOT_ABOVE_C {
        factor -= HOT_PENALTY;
    }
    if r.light_level > BRIGHT_ABOVE_PCT {
        factor -= BRIGHT_PENALTY;
    }
    if r.humidity < DRY_AIR_BELOW_PCT {
        factor -= DRY_AIR_PENALTY;
    }
    f64::max(FACTOR_FLOOR, factor)
}

pub fn assess(
    history: &History,
    profile: Option<&CareProfile>,
    last_watered_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ThirstAssessment {
    let since = hours_since(last_watered_at, now);
    let Some(profile) = profile else {
        return ThirstAssessment::unknown(since);
    };

    let hours = since.unwrap_or(NEVER_WATERED_HOURS);
    let factor = stress_factor(history);
    let base = profile.watering_interval_hours();
    let adjusted = base * factor;
    let is_thirsty = hours > adjusted;

    let reason = match (is_thirsty, hours > base) {
        (true, true) => Some(ThirstReason::IntervalReached),
        (true, false) => Some(ThirstReason::TranspirationStress),
        (false, _) => None,
    };

    let stress_score = 1.0 - factor;
    ThirstAssessment {
        profile_loaded: true,
        is_thirsty,
        reason,
        stress_score,
        stress_factor: factor,
        elevated: stress_score > ELEVATED_STRESS,
        hours_since_watering: since,
        base_interval_hours: base,
        adjusted_interval_hours: adjusted,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
