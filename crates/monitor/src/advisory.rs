//! Client side of the advisory collaborator: species care profiles, health
//! reports over a window of readings, and botanical facts.
//!
//! Every caller goes through a fail-closed wrapper ([`crate::care::load`],
//! [`health_report_or_default`], [`fact_or_default`]) so an unavailable or
//! slow collaborator never surfaces as an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::care::CareProfile;
use crate::config::AdvisorySettings;
use crate::reading::Reading;

/// Readings sent along with a health report request.
pub const HEALTH_WINDOW: usize = 10;

/// Fewer readings than this and a health report is not requested at all.
pub const MIN_HEALTH_READINGS: usize = 3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("advisory service not configured")]
    Unavailable,

    #[error("advisory request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Optimal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub summary: String,
    pub recommendation: String,
    pub status: HealthStatus,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            summary: "Analyzing historical patterns...".to_string(),
            recommendation: "Ensure consistent watering schedules.".to_string(),
            status: HealthStatus::Optimal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantFact {
    pub fact: String,
    pub category: String,
}

impl Default for PlantFact {
    fn default() -> Self {
        Self {
            fact: "Plants are vital for life.".to_string(),
            category: "General".to_string(),
        }
    }
}

#[derive(Serialize)]
struct HealthRequest<'a> {
    readings: &'a [Reading],
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<&'a CareProfile>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Advisor: Send + Sync {
    async fn care_profile(&self, species: &str) -> Result<CareProfile, AdvisoryError>;

    async fn health_report(
        &self,
        window: &[Reading],
        profile: Option<&CareProfile>,
    ) -> Result<HealthReport, AdvisoryError>;

    async fn plant_fact(&self) -> Result<PlantFact, AdvisoryError>;
}

/// Build the advisor described by the config. An empty base URL means
/// offline: every request falls back to built-in defaults.
pub fn from_settings(cfg: &AdvisorySettings) -> Result<Arc<dyn Advisor>> {
    if cfg.base_url.trim().is_empty() {
        return Ok(Arc::new(OfflineAdvisor));
    }
    let advisor = HttpAdvisor::new(&cfg.base_url, Duration::from_secs(cfg.timeout_sec))?;
    Ok(Arc::new(advisor))
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpAdvisor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAdvisor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build advisory http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn care_profile(&self, species: &str) -> Result<CareProfile, AdvisoryError> {
        let profile = self
            .client
            .get(self.url("care-profile"))
            .query(&[("species", species)])
            .send()
            .await?
            .error_for_status()?
            .json::<CareProfile>()
            .await?;
        Ok(profile)
    }

    async fn health_report(
        &self,
        window: &[Reading],
        profile: Option<&CareProfile>,
    ) -> Result<HealthReport, AdvisoryError> {
        let report = self
            .client
            .post(self.url("health-report"))
            .json(&HealthRequest {
                readings: window,
                profile,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<HealthReport>()
            .await?;
        Ok(report)
    }

    async fn plant_fact(&self) -> Result<PlantFact, AdvisoryError> {
        let fact = self
            .client
            .get(self.url("fact"))
            .send()
            .await?
            .error_for_status()?
            .json::<PlantFact>()
            .await?;
        Ok(fact)
    }
}

// ---------------------------------------------------------------------------
// Offline implementation
// ---------------------------------------------------------------------------

pub struct OfflineAdvisor;

#[async_trait]
impl Advisor for OfflineAdvisor {
    async fn care_profile(&self, _species: &str) -> Result<CareProfile, AdvisoryError> {
        Err(AdvisoryError::Unavailable)
    }

    async fn health_report(
        &self,
        _window: &[Reading],
        _profile: Option<&CareProfile>,
    ) -> Result<HealthReport, AdvisoryError> {
        Err(AdvisoryError::Unavailable)
    }

    async fn plant_fact(&self) -> Result<PlantFact, AdvisoryError> {
        Err(AdvisoryError::Unavailable)
    }
}

// ---------------------------------------------------------------------------
// Fail-closed wrappers
// ---------------------------------------------------------------------------

/// Health report over the most recent [`HEALTH_WINDOW`] readings. Returns
/// `None` when fewer than [`MIN_HEALTH_READINGS`] readings are available.
pub async fn health_report_or_default(
    advisor: &dyn Advisor,
    readings: &[Reading],
    profile: Option<&CareProfile>,
) -> Option<HealthReport> {
    if readings.len() < MIN_HEALTH_READINGS {
        return None;
    }
    let window = &readings[readings.len().saturating_sub(HEALTH_WINDOW)..];
    match advisor.health_report(window, profile).await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("health report unavailable, using default: {e}");
            Some(HealthReport::default())
        }
    }
}

pub async fn fact_or_default(advisor: &dyn Advisor) -> PlantFact {
    advisor.plant_fact().await.unwrap_or_else(|e| {
        warn!("plant fact unavailable, using default: {e}");
        PlantFact::default()
    })
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Advisor answering every request from fixed values.
#[cfg(test)]
pub(crate) struct StaticAdvisor {
    pub(crate) profile: CareProfile,
    pub(crate) report: HealthReport,
    pub(crate) fact: PlantFact,
}

#[cfg(test)]
impl StaticAdvisor {
    pub(crate) fn new(profile: CareProfile) -> Self {
        Self {
            profile,
            report: HealthReport {
                summary: "Thriving.".into(),
                recommendation: "Keep going.".into(),
                status: HealthStatus::Optimal,
            },
            fact: PlantFact {
                fact: "Bamboo can grow 91 cm in a day.".into(),
                category: "Growth".into(),
            },
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Advisor for StaticAdvisor {
    async fn care_profile(&self, _species: &str) -> Result<CareProfile, AdvisoryError> {
        Ok(self.profile.clone())
    }

    async fn health_report(
        &self,
        _window: &[Reading],
        _profile: Option<&CareProfile>,
    ) -> Result<HealthReport, AdvisoryError> {
        Ok(self.report.clone())
    }

    async fn plant_fact(&self) -> Result<PlantFact, AdvisoryError> {
        Ok(self.fact.clone())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
