//! Species care profiles and the per-session cache that holds the active one.
//!
//! Profiles come from the advisory collaborator. [`load`] never fails: any
//! advisory error is logged and replaced with [`CareProfile::fallback`].

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::advisory::Advisor;
use crate::reading::Reading;

/// Watering interval used when no profile is loaded or the profile carries
/// no usable interval.
pub const DEFAULT_WATERING_INTERVAL_HOURS: f64 = 72.0;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

/// Field names match the advisory collaborator's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareProfile {
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub scientific_name: String,
    #[serde(default)]
    pub origin: String,
    #[serde(rename = "idealTemp")]
    pub ideal_temperature: Band,
    pub ideal_humidity: Band,
    pub ideal_light: Band,
    #[serde(rename = "wateringIntervalHours", default = "default_interval")]
    pub base_watering_interval_hours: f64,
    #[serde(rename = "careSummary", default)]
    pub advisory_text: String,
}

fn default_interval() -> f64 {
    DEFAULT_WATERING_INTERVAL_HOURS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Temperature,
    Humidity,
    Light,
}

impl CareProfile {
    /// Mid-range profile used whenever the advisory collaborator fails.
    pub fn fallback(species: &str) -> Self {
        Self {
            common_name: species.to_string(),
            scientific_name: "Unknown".to_string(),
            origin: "Global".to_string(),
            ideal_temperature: Band::new(18.0, 28.0),
            ideal_humidity: Band::new(40.0, 60.0),
            ideal_light: Band::new(30.0, 80.0),
            base_watering_interval_hours: DEFAULT_WATERING_INTERVAL_HOURS,
            advisory_text: "Maintain moderate conditions.".to_string(),
        }
    }

    /// Base interval, falling back to the default for zero, negative or
    /// non-finite values.
    pub fn watering_interval_hours(&self) -> f64 {
        let h = self.base_watering_interval_hours;
        if h.is_finite() && h > 0.0 {
            h
        } else {
            DEFAULT_WATERING_INTERVAL_HOURS
        }
    }

    /// Metrics of `reading` that fall outside the ideal bands.
    pub fn out_of_range(&self, reading: &Reading) -> Vec<Metric> {
        let mut out = Vec::new();
        if !self.ideal_temperature.contains(reading.temperature) {
            out.push(Metric::Temperature);
        }
        if !self.ideal_humidity.contains(reading.humidity) {
            out.push(Metric::Humidity);
        }
        if !self.ideal_light.contains(reading.light_level) {
            out.push(Metric::Light);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Fetch the profile for `species`, falling back to defaults on any error.
pub async fn load(advisor: &dyn Advisor, species: &str) -> CareProfile {
    match advisor.care_profile(species).await {
        Ok(profile) => {
            info!(
                species,
                interval_h = profile.watering_interval_hours(),
                "care profile loaded"
            );
            profile
        }
        Err(e) => {
            warn!(species, "care profile unavailable, using defaults: {e}");
            CareProfile::fallback(species)
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Holds the active device's profile. Absent between [`invalidate`] and the
/// matching [`install`].
///
/// [`invalidate`]: CareProfileCache::invalidate
/// [`install`]: CareProfileCache::install
#[derive(Debug, Default)]
pub struct CareProfileCache {
    profile: Option<CareProfile>,
    species: Option<String>,
    generation: u64,
}

impl CareProfileCache {
    pub fn invalidate(&mut self) {
        self.profile = None;
        self.species = None;
    }

    /// Record that a fetch for `species` was issued under `generation`.
    pub fn begin(&mut self, species: &str, generation: u64) {
        self.profile = None;
        self.species = Some(species.to_string());
        self.generation = generation;
    }

    /// Install a fetched profile. Results from an older generation, or
    /// arriving after an invalidation, are dropped.
    pub fn install(&mut self, generation: u64, profile: CareProfile) -> bool {
        if self.species.is_none() || generation != self.generation {
            return false;
        }
        self.profile = Some(profile);
        true
    }

    pub fn profile(&self) -> Option<&CareProfile> {
        self.profile.as_ref()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
