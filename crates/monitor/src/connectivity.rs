use chrono::{DateTime, Utc};
use serde::Serialize;

/// Liveness of the active telemetry source.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectivity {
    pub connected: bool,
    pub changed_at: Option<DateTime<Utc>>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub last_error: Option<String>,
}

impl Connectivity {
    /// Returns true if this changed the connected flag.
    pub fn mark_connected(&mut self, now: DateTime<Utc>) -> bool {
        if self.connected {
            return false;
        }
        self.connected = true;
        self.changed_at = Some(now);
        true
    }

    /// Returns true if this changed the connected flag.
    pub fn mark_disconnected(&mut self, reason: String, now: DateTime<Utc>) -> bool {
        self.last_error = Some(reason);
        if !self.connected {
            return false;
        }
        self.connected = false;
        self.changed_at = Some(now);
        true
    }

    pub fn record_frame(&mut self, now: DateTime<Utc>) {
        self.frames_received += 1;
        self.last_frame_at = Some(now);
    }

    /// A rejected frame leaves the connection up.
    pub fn record_rejected(&mut self, reason: String) {
        self.frames_rejected += 1;
        self.last_error = Some(reason);
    }

    /// Forget everything about the previous source.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
