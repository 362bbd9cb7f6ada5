//! Irrigation controller: decides when to water and tracks each watering
//! cycle to its end.
//!
//! The controller never performs I/O. Every transition returns [`Action`]s
//! (dispatch a command, arm a timer) that the session executes.
//!
//! ## State machine
//!
//! ```text
//!        manual request / autonomous trigger (thirsty + cooldown elapsed)
//! Idle ─────────────────────────────────────────────────────────▶ Watering
//!  ▲                                                                 │
//!  │  simulated: cycle timer fired                                   │
//!  │  live:      valve left `open` after a confirmed open edge       │
//!  │  live:      confirmation timer fired with no open edge          │
//!  │  live:      completion timer fired with the valve still open    │
//!  └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! On the live path the station's telemetry is the source of truth: a
//! closed→open valve edge stamps `last_watered_at`, whether or not this
//! controller asked for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mqtt::Command;
use crate::reading::{Reading, ValveState};
use crate::source::TransportMode;
use crate::thirst::ThirstAssessment;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringMode {
    Manual,
    Autonomous,
}

impl WateringMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Manual => Self::Autonomous,
            Self::Autonomous => Self::Manual,
        }
    }
}

impl fmt::Display for WateringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Autonomous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Simulated cycle finished.
    SimCycleComplete { cycle: u64 },
    /// Live cycle still waiting for the station to open its valve.
    ConfirmTimeout { cycle: u64 },
    /// Confirmed live cycle whose valve never reported closing.
    CompletionTimeout { cycle: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Completed,
    Unconfirmed,
    #[serde(rename = "timed_out")]
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Started { cycle: u64, trigger: Trigger },
    Dispatch(Command),
    Schedule { timer: Timer, after: Duration },
    ValveOpened { at: DateTime<Utc> },
    Finished { cycle: u64, outcome: CycleOutcome },
    Ignored(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct IrrigationSettings {
    /// Minimum gap between autonomous trigger attempts.
    pub cooldown: Duration,
    /// Length of a simulated watering cycle.
    pub sim_cycle: Duration,
    /// How long a live cycle waits for the valve to open.
    pub confirm_timeout: Duration,
    /// Upper bound on a confirmed live cycle.
    pub completion_timeout: Duration,
}

impl Default for IrrigationSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            sim_cycle: Duration::from_secs(4),
            confirm_timeout: Duration::from_secs(120),
            completion_timeout: Duration::from_secs(600),
        }
    }
}

/// Externally visible irrigation state. Only the controller mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationState {
    pub is_watering: bool,
    pub last_watered_at: Option<DateTime<Utc>>,
    pub valve: ValveState,
    pub mode: WateringMode,
    pub cooldown_until: Option<DateTime<Utc>>,
}

enum Phase {
    Idle,
    Watering { cycle: u64, confirmed: bool },
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct IrrigationController {
    settings: IrrigationSettings,
    state: IrrigationState,
    transport: TransportMode,
    phase: Phase,
    next_cycle: u64,
    last_auto_attempt: Option<DateTime<Utc>>,
}

impl IrrigationController {
    pub fn new(settings: IrrigationSettings, mode: WateringMode, transport: TransportMode) -> Self {
        Self {
            settings,
            state: IrrigationState {
                is_watering: false,
                last_watered_at: None,
                valve: ValveState::Closed,
                mode,
                cooldown_until: None,
            },
            transport,
            phase: Phase::Idle,
            next_cycle: 1,
            last_auto_attempt: None,
        }
    }

    pub fn state(&self) -> &IrrigationState {
        &self.state
    }

    /// Selects the completion path for cycles started from now on. A cycle
    /// already in flight finishes on the path it started with.
    pub fn set_transport(&mut self, transport: TransportMode) {
        self.transport = transport;
    }

    pub fn set_mode(&mut self, mode: WateringMode) {
        if self.state.mode != mode {
            info!(%mode, "irrigation: mode changed");
        }
        self.state.mode = mode;
    }

    pub fn toggle_mode(&mut self) -> WateringMode {
        self.set_mode(self.state.mode.toggled());
        self.state.mode
    }

    /// Forget the last reported valve state when the telemetry source
    /// changes, so the new station's first `open` frame counts as an edge.
    /// A cycle in flight keeps its valve state.
    pub fn reset_valve(&mut self) {
        if matches!(self.phase, Phase::Idle) {
            self.state.valve = ValveState::Closed;
        }
    }

    /// Caller-initiated watering, honoured in either mode.
    pub fn request(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        if matches!(self.phase, Phase::Watering { .. }) {
            return vec![Action::Ignored("watering already in progress")];
        }
        self.start(Trigger::Manual, now)
    }

    /// Autonomous trigger check, run after every re-evaluation.
    pub fn evaluate(&mut self, thirst: &ThirstAssessment, now: DateTime<Utc>) -> Vec<Action> {
        if self.state.mode != WateringMode::Autonomous
            || !thirst.is_thirsty
            || matches!(self.phase, Phase::Watering { .. })
        {
            return Vec::new();
        }

        if let Some(last) = self.last_auto_attempt {
            let elapsed_ms = (now - last).num_milliseconds();
            if elapsed_ms < self.settings.cooldown.as_millis() as i64 {
                debug!(elapsed_ms, "irrigation: autonomous trigger in cooldown");
                return Vec::new();
            }
        }

        self.last_auto_attempt = Some(now);
        self.state.cooldown_until =
            Some(now + chrono::Duration::milliseconds(self.settings.cooldown.as_millis() as i64));

        info!(
            reason = ?thirst.reason,
            stress = thirst.stress_score,
            "irrigation: plant thirsty, starting autonomous cycle"
        );
        self.start(Trigger::Autonomous, now)
    }

    /// Track the valve state reported by the live station.
    pub fn observe(&mut self, reading: &Reading) -> Vec<Action> {
        if self.transport != TransportMode::Live {
            return Vec::new();
        }

        let prev = self.state.valve;
        self.state.valve = reading.valve;
        let mut actions = Vec::new();

        match (prev, reading.valve) {
            (ValveState::Closed, ValveState::Open) => {
                self.state.last_watered_at = Some(reading.captured_at);
                info!(at = %reading.captured_at, "irrigation: valve opened");
                actions.push(Action::ValveOpened {
                    at: reading.captured_at,
                });
                if let Phase::Watering {
                    cycle,
                    confirmed: false,
                } = self.phase
                {
                    self.phase = Phase::Watering {
                        cycle,
                        confirmed: true,
                    };
                    actions.push(Action::Schedule {
                        timer: Timer::CompletionTimeout { cycle },
                        after: self.settings.completion_timeout,
                    });
                }
            }
            // `unknown` after `open` means the close edge may never arrive.
            (ValveState::Open, ValveState::Closed | ValveState::Unknown) => {
                if let Phase::Watering {
                    cycle,
                    confirmed: true,
                } = self.phase
                {
                    actions.push(self.finish(cycle, CycleOutcome::Completed));
                }
            }
            _ => {}
        }

        actions
    }

    pub fn on_timer(&mut self, timer: Timer, now: DateTime<Utc>) -> Vec<Action> {
        let Phase::Watering { cycle, confirmed } = self.phase else {
            return Vec::new();
        };

        match timer {
            Timer::SimCycleComplete { cycle: c } if c == cycle => {
                self.state.valve = ValveState::Closed;
                self.state.last_watered_at = Some(now);
                vec![self.finish(cycle, CycleOutcome::Completed)]
            }
            Timer::ConfirmTimeout { cycle: c } if c == cycle && !confirmed => {
                warn!(cycle, "irrigation: no valve activity observed, giving up");
                vec![self.finish(cycle, CycleOutcome::Unconfirmed)]
            }
            Timer::CompletionTimeout { cycle: c } if c == cycle && confirmed => {
                warn!(cycle, "irrigation: valve never reported closing, ending cycle");
                vec![self.finish(cycle, CycleOutcome::TimedOut)]
            }
            _ => Vec::new(),
        }
    }

    fn start(&mut self, trigger: Trigger, now: DateTime<Utc>) -> Vec<Action> {
        let cycle = self.next_cycle;
        self.next_cycle += 1;
        self.phase = Phase::Watering {
            cycle,
            confirmed: false,
        };
        self.state.is_watering = true;

        info!(cycle, ?trigger, transport = %self.transport, at = %now, "irrigation: cycle started");

        let mut actions = vec![Action::Started { cycle, trigger }];
        match self.transport {
            TransportMode::Simulated => {
                self.state.valve = ValveState::Open;
                actions.push(Action::Schedule {
                    timer: Timer::SimCycleComplete { cycle },
                    after: self.settings.sim_cycle,
                });
            }
            TransportMode::Live => {
                actions.push(Action::Dispatch(Command::WaterNow));
                actions.push(Action::Schedule {
                    timer: Timer::ConfirmTimeout { cycle },
                    after: self.settings.confirm_timeout,
                });
            }
        }
        actions
    }

    fn finish(&mut self, cycle: u64, outcome: CycleOutcome) -> Action {
        self.phase = Phase::Idle;
        self.state.is_watering = false;
        info!(cycle, ?outcome, "irrigation: cycle finished");
        Action::Finished { cycle, outcome }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn secs(s: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(s)
    }

    fn thirsty() -> ThirstAssessment {
        ThirstAssessment {
            profile_loaded: true,
            is_thirsty: true,
            ..ThirstAssessment::default()
        }
    }

    fn controller(mode: WateringMode, transport: TransportMode) -> IrrigationController {
        IrrigationController::new(IrrigationSettings::default(), mode, transport)
    }

    fn reading(valve: ValveState, at: DateTime<Utc>) -> Reading {
        Reading::new(50.0, 22.0, 50.0, valve, at)
    }

    fn started(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::Started { .. }))
    }

    fn dispatch_count(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Dispatch(Command::WaterNow)))
            .count()
    }

    // -- manual requests ----------------------------------------------------

    #[test]
    fn manual_request_sets_watering_immediately() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        let actions = c.request(t0());
        assert!(c.state().is_watering);
        assert!(started(&actions));
    }

    #[test]
    fn manual_request_honoured_in_autonomous_mode() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Simulated);
        assert!(started(&c.request(t0())));
    }

    #[test]
    fn manual_request_while_watering_is_ignored() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        c.request(t0());
        assert_eq!(
            c.request(secs(1)),
            vec![Action::Ignored("watering already in progress")]
        );
    }

    #[test]
    fn manual_request_does_not_arm_cooldown() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Simulated);
        c.request(t0());
        c.on_timer(Timer::SimCycleComplete { cycle: 1 }, secs(4));
        assert!(started(&c.evaluate(&thirsty(), secs(5))));
    }

    // -- simulated completion -----------------------------------------------

    #[test]
    fn simulated_cycle_schedules_completion() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        let actions = c.request(t0());
        assert!(actions.contains(&Action::Schedule {
            timer: Timer::SimCycleComplete { cycle: 1 },
            after: Duration::from_secs(4),
        }));
        assert_eq!(dispatch_count(&actions), 0);
        assert_eq!(c.state().valve, ValveState::Open);
    }

    #[test]
    fn simulated_completion_stamps_and_closes() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        c.request(t0());
        let actions = c.on_timer(Timer::SimCycleComplete { cycle: 1 }, secs(4));
        assert_eq!(
            actions,
            vec![Action::Finished {
                cycle: 1,
                outcome: CycleOutcome::Completed
            }]
        );
        let st = c.state();
        assert!(!st.is_watering);
        assert_eq!(st.valve, ValveState::Closed);
        assert_eq!(st.last_watered_at, Some(secs(4)));
    }

    #[test]
    fn stale_cycle_timer_is_ignored() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        c.request(t0());
        c.on_timer(Timer::SimCycleComplete { cycle: 1 }, secs(4));
        c.request(secs(10));
        assert!(c.on_timer(Timer::SimCycleComplete { cycle: 1 }, secs(11)).is_empty());
        assert!(c.state().is_watering);
    }

    #[test]
    fn simulated_readings_do_not_touch_valve() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        assert!(c.observe(&reading(ValveState::Open, t0())).is_empty());
        assert_eq!(c.state().valve, ValveState::Closed);
        assert!(c.state().last_watered_at.is_none());
    }

    // -- autonomous trigger -------------------------------------------------

    #[test]
    fn autonomous_ignored_in_manual_mode() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        assert!(c.evaluate(&thirsty(), t0()).is_empty());
        assert!(!c.state().is_watering);
    }

    #[test]
    fn autonomous_ignored_when_not_thirsty() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Simulated);
        assert!(c.evaluate(&ThirstAssessment::default(), t0()).is_empty());
    }

    #[test]
    fn autonomous_cooldown_gates_retriggers() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Live);
        let mut dispatches = 0;

        dispatches += dispatch_count(&c.evaluate(&thirsty(), t0()));
        // Station confirms and finishes quickly.
        c.observe(&reading(ValveState::Open, secs(1)));
        c.observe(&reading(ValveState::Closed, secs(3)));
        assert!(!c.state().is_watering);

        dispatches += dispatch_count(&c.evaluate(&thirsty(), secs(5)));
        assert_eq!(dispatches, 1);

        dispatches += dispatch_count(&c.evaluate(&thirsty(), secs(31)));
        assert_eq!(dispatches, 2);
    }

    #[test]
    fn cooldown_counts_attempts_that_never_watered() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Live);
        c.evaluate(&thirsty(), t0());
        // Nothing confirmed; confirmation window lapses.
        c.on_timer(Timer::ConfirmTimeout { cycle: 1 }, secs(20));
        assert!(!c.state().is_watering);
        assert!(c.evaluate(&thirsty(), secs(25)).is_empty());
        assert!(started(&c.evaluate(&thirsty(), secs(30))));
    }

    #[test]
    fn autonomous_trigger_sets_cooldown_until() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Simulated);
        c.evaluate(&thirsty(), t0());
        assert_eq!(c.state().cooldown_until, Some(secs(30)));
    }

    #[test]
    fn no_autonomous_trigger_while_watering() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Simulated);
        c.request(t0());
        assert!(c.evaluate(&thirsty(), secs(60)).is_empty());
    }

    // -- live path ----------------------------------------------------------

    #[test]
    fn live_cycle_dispatches_once_and_arms_confirmation() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        let actions = c.request(t0());
        assert_eq!(dispatch_count(&actions), 1);
        assert!(actions.contains(&Action::Schedule {
            timer: Timer::ConfirmTimeout { cycle: 1 },
            after: Duration::from_secs(120),
        }));
        // Valve is only reported by the station.
        assert_eq!(c.state().valve, ValveState::Closed);
    }

    #[test]
    fn open_edge_stamps_last_watered_exactly_once() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.observe(&reading(ValveState::Closed, secs(0)));
        let actions = c.observe(&reading(ValveState::Open, secs(5)));
        assert_eq!(actions, vec![Action::ValveOpened { at: secs(5) }]);
        assert_eq!(c.state().last_watered_at, Some(secs(5)));

        assert!(c.observe(&reading(ValveState::Open, secs(9))).is_empty());
        assert_eq!(c.state().last_watered_at, Some(secs(5)));
    }

    #[test]
    fn unknown_to_open_is_not_an_edge() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.observe(&reading(ValveState::Unknown, secs(0)));
        c.observe(&reading(ValveState::Open, secs(1)));
        assert!(c.state().last_watered_at.is_none());
        assert_eq!(c.state().valve, ValveState::Open);
    }

    #[test]
    fn confirmed_cycle_ends_on_close_edge() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.request(t0());
        c.observe(&reading(ValveState::Open, secs(2)));
        assert!(c.state().is_watering);
        // Confirmation timer no longer ends a confirmed cycle.
        assert!(c.on_timer(Timer::ConfirmTimeout { cycle: 1 }, secs(120)).is_empty());
        let actions = c.observe(&reading(ValveState::Closed, secs(130)));
        assert_eq!(
            actions,
            vec![Action::Finished {
                cycle: 1,
                outcome: CycleOutcome::Completed
            }]
        );
        assert!(!c.state().is_watering);
        assert_eq!(c.state().last_watered_at, Some(secs(2)));
    }

    #[test]
    fn unconfirmed_cycle_reverts_after_timeout() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.request(t0());
        let actions = c.on_timer(Timer::ConfirmTimeout { cycle: 1 }, secs(120));
        assert_eq!(
            actions,
            vec![Action::Finished {
                cycle: 1,
                outcome: CycleOutcome::Unconfirmed
            }]
        );
        assert!(!c.state().is_watering);
        assert!(c.state().last_watered_at.is_none());
    }

    #[test]
    fn confirmation_arms_completion_timeout() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.request(t0());
        let actions = c.observe(&reading(ValveState::Open, secs(2)));
        assert_eq!(
            actions,
            vec![
                Action::ValveOpened { at: secs(2) },
                Action::Schedule {
                    timer: Timer::CompletionTimeout { cycle: 1 },
                    after: Duration::from_secs(600),
                },
            ]
        );
    }

    #[test]
    fn open_then_unknown_ends_confirmed_cycle() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Live);
        c.request(t0());
        c.observe(&reading(ValveState::Open, secs(2)));
        let actions = c.observe(&reading(ValveState::Unknown, secs(4)));
        assert_eq!(
            actions,
            vec![Action::Finished {
                cycle: 1,
                outcome: CycleOutcome::Completed
            }]
        );
        assert!(!c.state().is_watering);
        assert!(c.observe(&reading(ValveState::Closed, secs(6))).is_empty());
        assert!(c.on_timer(Timer::ConfirmTimeout { cycle: 1 }, secs(120)).is_empty());

        let next_day = secs(24 * 3600);
        assert!(started(&c.evaluate(&thirsty(), next_day)));
    }

    #[test]
    fn confirmed_cycle_without_close_edge_times_out() {
        let mut c = controller(WateringMode::Autonomous, TransportMode::Live);
        c.request(t0());
        c.observe(&reading(ValveState::Open, secs(2)));
        // Close frame lost; the valve never reports anything else.
        assert!(c.on_timer(Timer::ConfirmTimeout { cycle: 1 }, secs(120)).is_empty());
        let actions = c.on_timer(Timer::CompletionTimeout { cycle: 1 }, secs(602));
        assert_eq!(
            actions,
            vec![Action::Finished {
                cycle: 1,
                outcome: CycleOutcome::TimedOut
            }]
        );
        assert!(!c.state().is_watering);
        assert_eq!(c.state().last_watered_at, Some(secs(2)));
        assert!(started(&c.evaluate(&thirsty(), secs(700))));
    }

    #[test]
    fn completion_timeout_ignored_before_confirmation() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.request(t0());
        assert!(c.on_timer(Timer::CompletionTimeout { cycle: 1 }, secs(1)).is_empty());
        assert!(c.state().is_watering);
    }

    #[test]
    fn reset_valve_only_when_idle() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.observe(&reading(ValveState::Open, secs(1)));
        c.reset_valve();
        assert_eq!(c.state().valve, ValveState::Closed);

        c.request(secs(2));
        c.observe(&reading(ValveState::Open, secs(3)));
        c.reset_valve();
        assert_eq!(c.state().valve, ValveState::Open);
    }

    #[test]
    fn open_edge_without_request_still_stamps() {
        let mut c = controller(WateringMode::Manual, TransportMode::Live);
        c.observe(&reading(ValveState::Open, secs(3)));
        assert_eq!(c.state().last_watered_at, Some(secs(3)));
        assert!(!c.state().is_watering);
    }

    // -- mode ---------------------------------------------------------------

    #[test]
    fn toggle_mode_flips_without_side_effects() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        assert_eq!(c.toggle_mode(), WateringMode::Autonomous);
        assert!(!c.state().is_watering);
        assert_eq!(c.toggle_mode(), WateringMode::Manual);
    }

    #[test]
    fn in_flight_cycle_keeps_its_completion_path() {
        let mut c = controller(WateringMode::Manual, TransportMode::Simulated);
        c.request(t0());
        c.set_transport(TransportMode::Live);
        let actions = c.on_timer(Timer::SimCycleComplete { cycle: 1 }, secs(4));
        assert_eq!(actions.len(), 1);
        assert!(!c.state().is_watering);
    }
}
