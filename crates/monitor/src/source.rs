//! Telemetry sources: a live MQTT subscription or a synthetic generator.
//!
//! Each started source runs as one tokio task and tags everything it emits
//! with the generation it was started under. Stopping aborts the task; any
//! event still queued from it is discarded by the session on arrival.

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::MqttSettings;
use crate::mqtt::{self, Command};
use crate::reading::{Reading, ValveState};
use crate::session::SessionEvent;
use crate::sim::Simulator;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Live,
    Simulated,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topics {
    pub data: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Reading(Reading),
    Connected,
    Disconnected(String),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published,
    /// Live transport is down; nothing was sent.
    NotConnected,
    /// Simulated transport has no station to send to.
    NotTransmitted,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct LiveLink {
    client: AsyncClient,
    command_topic: String,
    connected: Arc<AtomicBool>,
}

pub struct SourceHandle {
    generation: u64,
    mode: TransportMode,
    task: JoinHandle<()>,
    link: Option<LiveLink>,
}

impl SourceHandle {
    pub fn start(
        mode: TransportMode,
        generation: u64,
        topics: Topics,
        mqtt_cfg: &MqttSettings,
        sample_every: Duration,
        valve: watch::Receiver<ValveState>,
        tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        match mode {
            TransportMode::Simulated => {
                info!(generation, every = ?sample_every, "source: starting simulator");
                let task = tokio::spawn(run_simulated(generation, sample_every, valve, tx));
                Self {
                    generation,
                    mode,
                    task,
                    link: None,
                }
            }
            TransportMode::Live => {
                let client_id = mqtt::client_id(&mqtt_cfg.client_id_prefix);
                info!(
                    generation,
                    %client_id,
                    host = %mqtt_cfg.host,
                    port = mqtt_cfg.port,
                    topic = %topics.data,
                    "source: connecting to broker"
                );
                let opts = mqtt::mqtt_options(mqtt_cfg, client_id);
                let (client, eventloop) = AsyncClient::new(opts, 20);
                let connected = Arc::new(AtomicBool::new(false));
                let live = LiveLoop {
                    generation,
                    data_topic: topics.data,
                    client: client.clone(),
                    connected: Arc::clone(&connected),
                    connect_timeout: Duration::from_secs(mqtt_cfg.connect_timeout_sec),
                    reconnect_period: Duration::from_millis(mqtt_cfg.reconnect_period_ms),
                    tx,
                };
                let task = tokio::spawn(live.run(eventloop));
                Self {
                    generation,
                    mode,
                    task,
                    link: Some(LiveLink {
                        client,
                        command_topic: topics.command,
                        connected,
                    }),
                }
            }
        }
    }

    /// Tear the source down. Events it already queued still carry the old
    /// generation and are dropped by the session.
    pub fn stop(self) {
        info!(generation = self.generation, mode = %self.mode, "source: stopped");
        self.task.abort();
    }

    /// Fire-and-forget command to the station. Never waits for the broker.
    pub fn send_command(&self, cmd: Command) -> DispatchOutcome {
        let Some(link) = &self.link else {
            return DispatchOutcome::NotTransmitted;
        };
        if !link.connected.load(Ordering::Relaxed) {
            return DispatchOutcome::NotConnected;
        }
        match link.client.try_publish(
            link.command_topic.as_str(),
            QoS::AtLeastOnce,
            false,
            cmd.token().as_bytes().to_vec(),
        ) {
            Ok(()) => DispatchOutcome::Published,
            Err(e) => DispatchOutcome::Failed(e.to_string()),
        }
    }
}

async fn emit(tx: &mpsc::Sender<SessionEvent>, generation: u64, event: SourceEvent) -> bool {
    tx.send(SessionEvent::Source { generation, event }).await.is_ok()
}

// ---------------------------------------------------------------------------
// Simulated
// ---------------------------------------------------------------------------

async fn run_simulated(
    generation: u64,
    sample_every: Duration,
    valve: watch::Receiver<ValveState>,
    tx: mpsc::Sender<SessionEvent>,
) {
    let mut sim = Simulator::default();
    if !emit(&tx, generation, SourceEvent::Connected).await {
        return;
    }

    let mut ticker = interval_at(Instant::now() + sample_every, sample_every);
    loop {
        ticker.tick().await;
        let current = *valve.borrow();
        let reading = sim.next(current, Utc::now());
        if !emit(&tx, generation, SourceEvent::Reading(reading)).await {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Live
// ---------------------------------------------------------------------------

struct LiveLoop {
    generation: u64,
    data_topic: String,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    connect_timeout: Duration,
    reconnect_period: Duration,
    tx: mpsc::Sender<SessionEvent>,
}

impl LiveLoop {
    async fn run(self, mut eventloop: EventLoop) {
        let generation = self.generation;
        loop {
            let polled = if self.connected.load(Ordering::Relaxed) {
                eventloop.poll().await
            } else {
                match timeout(self.connect_timeout, eventloop.poll()).await {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(generation, "mqtt connect timed out. retrying...");
                        if !self.lost("connect timed out".to_string()).await {
                            return;
                        }
                        sleep(self.reconnect_period).await;
                        continue;
                    }
                }
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(generation, topic = %self.data_topic, "mqtt connected");
                    self.connected.store(true, Ordering::Relaxed);
                    if let Err(e) = self.client.try_subscribe(self.data_topic.as_str(), QoS::AtMostOnce) {
                        warn!(generation, "mqtt subscribe failed: {e}");
                    }
                    if !emit(&self.tx, generation, SourceEvent::Connected).await {
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if p.topic != self.data_topic {
                        debug!(generation, topic = %p.topic, "unhandled topic");
                        continue;
                    }
                    let event = match mqtt::parse_frame(&p.payload, Utc::now()) {
                        Ok(reading) => SourceEvent::Reading(reading),
                        Err(e) => {
                            warn!(generation, topic = %p.topic, "bad telemetry frame: {e}");
                            SourceEvent::Rejected(e.to_string())
                        }
                    };
                    if !emit(&self.tx, generation, event).await {
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!(generation, "mqtt disconnected by broker");
                    if !self.lost("broker closed the connection".to_string()).await {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(generation, "mqtt error: {e}. reconnecting...");
                    if !self.lost(format!("mqtt error: {e}")).await {
                        return;
                    }
                    sleep(self.reconnect_period).await;
                }
            }
        }
    }

    async fn lost(&self, reason: String) -> bool {
        self.connected.store(false, Ordering::Relaxed);
        emit(&self.tx, self.generation, SourceEvent::Disconnected(reason)).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerTransport;

    fn topics() -> Topics {
        Topics {
            data: "plants/test/sensors".into(),
            command: "plants/test/commands".into(),
        }
    }

    /// Broker settings pointing at a port nothing listens on.
    fn unreachable_broker() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            transport: BrokerTransport::Tcp,
            connect_timeout_sec: 1,
            reconnect_period_ms: 50,
            ..MqttSettings::default()
        }
    }

    async fn next_source_event(rx: &mut mpsc::Receiver<SessionEvent>) -> (u64, SourceEvent) {
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("source event in time")
            .expect("channel open");
        match ev {
            SessionEvent::Source { generation, event } => (generation, event),
            other => panic!("unexpected event {other:?}"),
        }
    }

    // -- simulated ----------------------------------------------------------

    #[tokio::test]
    async fn simulated_connects_then_streams_tagged_readings() {
        let (tx, mut rx) = mpsc::channel(16);
        let (_valve_tx, valve_rx) = watch::channel(ValveState::Open);
        let handle = SourceHandle::start(
            TransportMode::Simulated,
            7,
            topics(),
            &MqttSettings::default(),
            Duration::from_millis(10),
            valve_rx,
            tx,
        );

        assert_eq!(next_source_event(&mut rx).await, (7, SourceEvent::Connected));
        match next_source_event(&mut rx).await {
            (7, SourceEvent::Reading(r)) => assert_eq!(r.valve, ValveState::Open),
            other => panic!("expected reading, got {other:?}"),
        }
        handle.stop();
    }

    #[tokio::test]
    async fn simulated_send_command_is_not_transmitted() {
        let (tx, _rx) = mpsc::channel(16);
        let (_valve_tx, valve_rx) = watch::channel(ValveState::Closed);
        let handle = SourceHandle::start(
            TransportMode::Simulated,
            1,
            topics(),
            &MqttSettings::default(),
            Duration::from_secs(60),
            valve_rx,
            tx,
        );
        assert_eq!(
            handle.send_command(Command::WaterNow),
            DispatchOutcome::NotTransmitted
        );
        handle.stop();
    }

    #[tokio::test]
    async fn stopped_source_emits_nothing_more() {
        let (tx, mut rx) = mpsc::channel(64);
        let (_valve_tx, valve_rx) = watch::channel(ValveState::Closed);
        let handle = SourceHandle::start(
            TransportMode::Simulated,
            1,
            topics(),
            &MqttSettings::default(),
            Duration::from_millis(5),
            valve_rx,
            tx,
        );
        next_source_event(&mut rx).await;
        handle.stop();
        // Drain whatever was queued before the abort, then expect silence.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    // -- live ---------------------------------------------------------------

    #[tokio::test]
    async fn live_send_command_requires_connection() {
        let (tx, _rx) = mpsc::channel(16);
        let (_valve_tx, valve_rx) = watch::channel(ValveState::Closed);
        let handle = SourceHandle::start(
            TransportMode::Live,
            1,
            topics(),
            &unreachable_broker(),
            Duration::from_secs(4),
            valve_rx,
            tx,
        );
        assert_eq!(
            handle.send_command(Command::WaterNow),
            DispatchOutcome::NotConnected
        );
        handle.stop();
    }

    #[tokio::test]
    async fn live_reports_connection_failure() {
        let (tx, mut rx) = mpsc::channel(16);
        let (_valve_tx, valve_rx) = watch::channel(ValveState::Closed);
        let handle = SourceHandle::start(
            TransportMode::Live,
            3,
            topics(),
            &unreachable_broker(),
            Duration::from_secs(4),
            valve_rx,
            tx,
        );
        let (generation, event) = next_source_event(&mut rx).await;
        assert_eq!(generation, 3);
        assert!(matches!(event, SourceEvent::Disconnected(_)));
        handle.stop();
    }

    #[test]
    fn transport_mode_display() {
        assert_eq!(TransportMode::Live.to_string(), "live");
        assert_eq!(TransportMode::Simulated.to_string(), "simulated");
    }
}
