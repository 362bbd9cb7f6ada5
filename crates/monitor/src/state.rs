use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::Device;
use crate::reading::Reading;
use crate::session::SessionSnapshot;
use crate::thirst;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Shown in place of a timestamp when the plant was never watered.
const NEVER: &str = "Never";

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Read side of the session, written by the session driver after every
/// event and read by the HTTP API.
pub struct SystemState {
    started_at: Instant,
    devices: Vec<Device>,
    snapshot: SessionSnapshot,
    history: Vec<Reading>,
    events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Valve,
    Irrigation,
    Advisory,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub session: SessionSnapshot,
    /// `HH:MM:SS` (UTC) of the last watering, or `Never`.
    pub last_watered: String,
    pub hours_since_watering: Option<f64>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(snapshot: SessionSnapshot, devices: Vec<Device>) -> Self {
        Self {
            started_at: Instant::now(),
            devices,
            snapshot,
            history: Vec::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Replace the session view with the latest one.
    pub fn publish(&mut self, snapshot: SessionSnapshot, history: Vec<Reading>) {
        self.snapshot = snapshot;
        self.history = history;
    }

    pub fn record(&mut self, kind: EventKind, detail: String) {
        self.record_at(kind, detail, Utc::now());
    }

    pub fn record_at(&mut self, kind: EventKind, detail: String, ts: DateTime<Utc>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent { ts, kind, detail });
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn history(&self) -> &[Reading] {
        &self.history
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Build the JSON-serialisable status. Newest events first.
    pub fn to_status(&self, now: DateTime<Utc>) -> StatusResponse {
        let last = self.snapshot.irrigation.last_watered_at;
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            session: self.snapshot.clone(),
            last_watered: last
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| NEVER.to_string()),
            hours_since_watering: thirst::hours_since(last, now),
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
