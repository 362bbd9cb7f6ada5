//! Monitoring session: one active device, one telemetry source, one
//! irrigation controller.
//!
//! [`Session::handle`] is a pure transition: it consumes a [`SessionEvent`],
//! updates the session context and returns [`Effect`]s. [`run`] owns the
//! event channel and performs those effects (starting sources, spawning
//! timers and advisory fetches, writing the shared status).
//!
//! Every source start bumps the session generation. Source events and
//! profile fetches carry the generation they were issued under, and anything
//! from an older generation is dropped on arrival.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::advisory::Advisor;
use crate::care::{self, CareProfile, CareProfileCache, Metric};
use crate::config::{Config, Device, MqttSettings};
use crate::connectivity::Connectivity;
use crate::history::History;
use crate::irrigation::{
    Action, CycleOutcome, IrrigationController, IrrigationState, Timer, Trigger, WateringMode,
};
use crate::mqtt::Command;
use crate::reading::{Reading, ValveState};
use crate::source::{DispatchOutcome, SourceEvent, SourceHandle, Topics, TransportMode};
use crate::state::{EventKind, SharedState};
use crate::thirst::{self, ThirstAssessment};

// ---------------------------------------------------------------------------
// Events & effects
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SessionEvent {
    Source { generation: u64, event: SourceEvent },
    WaterRequested,
    ModeSelected(WateringMode),
    ModeToggled,
    DeviceSwitched(String),
    TransportSwitched(TransportMode),
    ProfileLoaded { generation: u64, profile: CareProfile },
    TimerFired(Timer),
    Tick,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartSource {
        mode: TransportMode,
        generation: u64,
        topics: Topics,
    },
    StopSource,
    FetchProfile { species: String, generation: u64 },
    Dispatch(Command),
    Schedule { timer: Timer, after: Duration },
    Record(EventKind, String),
}

/// Everything the status API shows about the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub device: Device,
    pub transport: TransportMode,
    pub generation: u64,
    pub connectivity: Connectivity,
    pub irrigation: IrrigationState,
    pub thirst: ThirstAssessment,
    pub latest: Option<Reading>,
    pub out_of_range: Vec<Metric>,
    pub profile: Option<CareProfile>,
    pub history_len: usize,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    devices: Vec<Device>,
    mqtt: MqttSettings,
    active: usize,
    transport: TransportMode,
    generation: u64,
    history: History,
    profile: CareProfileCache,
    irrigation: IrrigationController,
    connectivity: Connectivity,
    thirst: ThirstAssessment,
}

impl Session {
    pub fn new(cfg: &Config) -> Result<Self> {
        if cfg.devices.is_empty() {
            bail!("session needs at least one device");
        }
        let active = match &cfg.session.default_device {
            Some(id) => match cfg.devices.iter().position(|d| &d.id == id) {
                Some(i) => i,
                None => bail!("default device '{id}' is not in the registry"),
            },
            None => 0,
        };
        let transport = cfg.session.transport;

        Ok(Self {
            devices: cfg.devices.clone(),
            mqtt: cfg.mqtt.clone(),
            active,
            transport,
            generation: 0,
            history: History::with_capacity(cfg.session.history_capacity),
            profile: CareProfileCache::default(),
            irrigation: IrrigationController::new(
                cfg.irrigation.settings(),
                cfg.irrigation.mode,
                transport,
            ),
            connectivity: Connectivity::default(),
            thirst: ThirstAssessment::default(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.devices[self.active]
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    #[cfg(test)]
    fn profile(&self) -> Option<&CareProfile> {
        self.profile.profile()
    }

    #[cfg(test)]
    fn irrigation(&self) -> &IrrigationState {
        self.irrigation.state()
    }

    #[cfg(test)]
    fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    #[cfg(test)]
    fn thirst(&self) -> &ThirstAssessment {
        &self.thirst
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.generation
    }

    /// Valve state the simulated station should report.
    pub fn valve(&self) -> ValveState {
        self.irrigation.state().valve
    }

    /// Bring up the source for the initial device.
    pub fn start(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = vec![Effect::Record(
            EventKind::System,
            format!(
                "session started: {} ({}), {} transport",
                self.device().name,
                self.device().species,
                self.transport
            ),
        )];
        effects.extend(self.restart_source(now));
        effects
    }

    pub fn handle(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Vec<Effect> {
        match event {
            SessionEvent::Source { generation, event } => {
                if generation != self.generation {
                    debug!(
                        generation,
                        current = self.generation,
                        "session: dropping event from stale source"
                    );
                    return Vec::new();
                }
                self.on_source(event, now)
            }
            SessionEvent::WaterRequested => {
                let actions = self.irrigation.request(now);
                self.apply_actions(actions)
            }
            SessionEvent::ModeSelected(mode) => self.select_mode(mode),
            SessionEvent::ModeToggled => {
                let mode = self.irrigation.toggle_mode();
                vec![Effect::Record(
                    EventKind::Irrigation,
                    format!("watering mode set to {mode}"),
                )]
            }
            SessionEvent::DeviceSwitched(id) => self.switch_device(&id, now),
            SessionEvent::TransportSwitched(mode) => self.switch_transport(mode, now),
            SessionEvent::ProfileLoaded {
                generation,
                profile,
            } => {
                let interval_h = profile.watering_interval_hours();
                if !self.profile.install(generation, profile) {
                    debug!(generation, "session: dropping stale care profile");
                    return Vec::new();
                }
                let mut effects = vec![Effect::Record(
                    EventKind::Advisory,
                    format!(
                        "care profile ready for {}: water every {interval_h:.0} h",
                        self.device().species
                    ),
                )];
                effects.extend(self.reevaluate(now));
                effects
            }
            SessionEvent::TimerFired(timer) => {
                let actions = self.irrigation.on_timer(timer, now);
                let mut effects = self.apply_actions(actions);
                effects.extend(self.reevaluate(now));
                effects
            }
            SessionEvent::Tick => self.reevaluate(now),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let latest = self.history.latest().copied();
        let out_of_range = match (latest, self.profile.profile()) {
            (Some(r), Some(p)) => p.out_of_range(&r),
            _ => Vec::new(),
        };
        SessionSnapshot {
            device: self.device().clone(),
            transport: self.transport,
            generation: self.generation,
            connectivity: self.connectivity.clone(),
            irrigation: *self.irrigation.state(),
            thirst: self.thirst,
            latest,
            out_of_range,
            profile: self.profile.profile().cloned(),
            history_len: self.history.len(),
        }
    }

    // -- source events ------------------------------------------------------

    fn on_source(&mut self, event: SourceEvent, now: DateTime<Utc>) -> Vec<Effect> {
        match event {
            SourceEvent::Reading(reading) => {
                self.history.append(reading);
                self.connectivity.record_frame(now);
                let mut effects = vec![Effect::Record(
                    EventKind::Reading,
                    format!(
                        "{:.1}% rh, {:.1} °C, {:.0}% light, valve {}",
                        reading.humidity, reading.temperature, reading.light_level, reading.valve
                    ),
                )];
                let actions = self.irrigation.observe(&reading);
                effects.extend(self.apply_actions(actions));
                effects.extend(self.reevaluate(now));
                effects
            }
            SourceEvent::Connected => {
                if self.connectivity.mark_connected(now) {
                    info!(transport = %self.transport, "session: telemetry source connected");
                    vec![Effect::Record(
                        EventKind::System,
                        format!("{} source connected", self.transport),
                    )]
                } else {
                    Vec::new()
                }
            }
            SourceEvent::Disconnected(reason) => {
                let changed = self.connectivity.mark_disconnected(reason.clone(), now);
                if changed {
                    vec![Effect::Record(
                        EventKind::Error,
                        format!("{} source lost: {reason}", self.transport),
                    )]
                } else {
                    Vec::new()
                }
            }
            SourceEvent::Rejected(reason) => {
                self.connectivity.record_rejected(reason.clone());
                vec![Effect::Record(
                    EventKind::Error,
                    format!("frame dropped: {reason}"),
                )]
            }
        }
    }

    // -- controls -----------------------------------------------------------

    fn select_mode(&mut self, mode: WateringMode) -> Vec<Effect> {
        if self.irrigation.state().mode == mode {
            return Vec::new();
        }
        self.irrigation.set_mode(mode);
        vec![Effect::Record(
            EventKind::Irrigation,
            format!("watering mode set to {mode}"),
        )]
    }

    fn switch_device(&mut self, id: &str, now: DateTime<Utc>) -> Vec<Effect> {
        if self.device().id == id {
            return Vec::new();
        }
        let Some(index) = self.devices.iter().position(|d| d.id == id) else {
            warn!(device = %id, "session: unknown device");
            return vec![Effect::Record(
                EventKind::Error,
                format!("unknown device '{id}'"),
            )];
        };

        self.active = index;
        info!(device = %id, species = %self.device().species, "session: device switched");
        let mut effects = vec![Effect::Record(
            EventKind::System,
            format!(
                "switched to {} ({})",
                self.device().name,
                self.device().species
            ),
        )];
        effects.extend(self.restart_source(now));
        effects
    }

    fn switch_transport(&mut self, mode: TransportMode, now: DateTime<Utc>) -> Vec<Effect> {
        if self.transport == mode {
            return Vec::new();
        }
        self.transport = mode;
        self.irrigation.set_transport(mode);
        info!(transport = %mode, "session: transport switched");
        let mut effects = vec![Effect::Record(
            EventKind::System,
            format!("transport switched to {mode}"),
        )];
        effects.extend(self.restart_source(now));
        effects
    }

    /// Tear down the current source and start a fresh one under a new
    /// generation. History and care profile are cleared before anything
    /// from the new source can arrive.
    fn restart_source(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.generation > 0 {
            effects.push(Effect::StopSource);
        }

        self.generation += 1;
        self.history.reset();
        self.connectivity.reset();
        self.profile.invalidate();
        self.irrigation.reset_valve();

        let device = self.device().clone();
        self.profile.begin(&device.species, self.generation);
        self.thirst = thirst::assess(
            &self.history,
            None,
            self.irrigation.state().last_watered_at,
            now,
        );

        effects.push(Effect::StartSource {
            mode: self.transport,
            generation: self.generation,
            topics: device.topics(&self.mqtt),
        });
        effects.push(Effect::FetchProfile {
            species: device.species,
            generation: self.generation,
        });
        effects
    }

    // -- evaluation ---------------------------------------------------------

    fn reevaluate(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        self.thirst = thirst::assess(
            &self.history,
            self.profile.profile(),
            self.irrigation.state().last_watered_at,
            now,
        );
        let actions = self.irrigation.evaluate(&self.thirst, now);
        self.apply_actions(actions)
    }

    fn apply_actions(&self, actions: Vec<Action>) -> Vec<Effect> {
        actions
            .into_iter()
            .map(|action| match action {
                Action::Started { cycle, trigger } => Effect::Record(
                    EventKind::Irrigation,
                    format!("cycle {cycle} started ({})", trigger_label(trigger)),
                ),
                Action::Dispatch(cmd) => Effect::Dispatch(cmd),
                Action::Schedule { timer, after } => Effect::Schedule { timer, after },
                Action::ValveOpened { at } => Effect::Record(
                    EventKind::Valve,
                    format!("valve opened at {}", at.format("%H:%M:%S")),
                ),
                Action::Finished { cycle, outcome } => Effect::Record(
                    EventKind::Irrigation,
                    format!("cycle {cycle} {}", outcome_label(outcome)),
                ),
                Action::Ignored(why) => {
                    Effect::Record(EventKind::Irrigation, format!("request ignored: {why}"))
                }
            })
            .collect()
    }
}

fn trigger_label(trigger: Trigger) -> &'static str {
    match trigger {
        Trigger::Manual => "manual",
        Trigger::Autonomous => "autonomous",
    }
}

fn outcome_label(outcome: CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Completed => "completed",
        CycleOutcome::Unconfirmed => "unconfirmed: no valve activity reported",
        CycleOutcome::TimedOut => "timed out: valve never reported closed",
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// What the driver needs besides the session itself.
pub struct Runtime {
    pub shared: SharedState,
    pub advisor: Arc<dyn Advisor>,
    pub mqtt: MqttSettings,
    pub sample_every: Duration,
    pub evaluate_every: Duration,
}

struct Executor {
    rt: Runtime,
    tx: mpsc::Sender<SessionEvent>,
    valve_tx: watch::Sender<ValveState>,
    source: Option<SourceHandle>,
}

/// Run the session for the life of the process. The driver keeps `tx` for
/// its own timers and fetches, so `rx` never closes. Events are handled
/// strictly one at a time in arrival order.
pub async fn run(
    mut session: Session,
    rt: Runtime,
    tx: mpsc::Sender<SessionEvent>,
    mut rx: mpsc::Receiver<SessionEvent>,
) {
    let (valve_tx, _) = watch::channel(session.valve());
    let mut ticker = interval(rt.evaluate_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut exec = Executor {
        rt,
        tx,
        valve_tx,
        source: None,
    };

    let now = Utc::now();
    let effects = session.start(now);
    exec.apply(effects).await;
    exec.publish(&session).await;

    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        let event = tokio::select! {
            Some(ev) = rx.recv() => ev,
            _ = ticker.tick() => SessionEvent::Tick,
        };

        let effects = session.handle(event, Utc::now());
        exec.apply(effects).await;
        exec.publish(&session).await;
    }
}

impl Executor {
    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartSource {
                    mode,
                    generation,
                    topics,
                } => {
                    if let Some(old) = self.source.take() {
                        old.stop();
                    }
                    self.source = Some(SourceHandle::start(
                        mode,
                        generation,
                        topics,
                        &self.rt.mqtt,
                        self.rt.sample_every,
                        self.valve_tx.subscribe(),
                        self.tx.clone(),
                    ));
                }
                Effect::StopSource => {
                    if let Some(old) = self.source.take() {
                        old.stop();
                    }
                }
                Effect::FetchProfile {
                    species,
                    generation,
                } => {
                    let advisor = Arc::clone(&self.rt.advisor);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let profile = care::load(advisor.as_ref(), &species).await;
                        let _ = tx
                            .send(SessionEvent::ProfileLoaded {
                                generation,
                                profile,
                            })
                            .await;
                    });
                }
                Effect::Dispatch(cmd) => self.dispatch(cmd).await,
                Effect::Schedule { timer, after } => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        sleep(after).await;
                        let _ = tx.send(SessionEvent::TimerFired(timer)).await;
                    });
                }
                Effect::Record(kind, detail) => {
                    self.rt.shared.write().await.record(kind, detail);
                }
            }
        }
    }

    async fn dispatch(&mut self, cmd: Command) {
        let Some(source) = &self.source else {
            warn!(?cmd, "session: no source to dispatch to");
            return;
        };
        let (kind, detail) = match source.send_command(cmd) {
            DispatchOutcome::Published => {
                info!(command = cmd.token(), "session: command published");
                (EventKind::Irrigation, format!("{} sent", cmd.token()))
            }
            DispatchOutcome::NotTransmitted => {
                debug!(command = cmd.token(), "session: simulated source, command not sent");
                return;
            }
            DispatchOutcome::NotConnected => {
                warn!(command = cmd.token(), "session: broker not connected, command dropped");
                (
                    EventKind::Error,
                    format!("{} not sent: broker not connected", cmd.token()),
                )
            }
            DispatchOutcome::Failed(e) => {
                warn!(command = cmd.token(), "session: publish failed: {e}");
                (
                    EventKind::Error,
                    format!("{} not sent: {e}", cmd.token()),
                )
            }
        };
        self.rt.shared.write().await.record(kind, detail);
    }

    async fn publish(&mut self, session: &Session) {
        self.valve_tx.send_if_modified(|v| {
            let next = session.valve();
            if *v == next {
                false
            } else {
                *v = next;
                true
            }
        });
        let mut st = self.rt.shared.write().await;
        st.publish(session.snapshot(), session.history().to_vec());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
