mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, str::FromStr, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{ClimateSim, Scenario};

/// Command token that opens the valve.
const WATER_NOW: &str = "WATER_NOW";

/// Telemetry frame as the physical station publishes it.
#[derive(Debug, Serialize)]
struct Frame {
    humidity: f64,
    temp: f64,
    light: u16,
    valve: &'static str,
}

fn is_water_command(payload: &[u8]) -> bool {
    std::str::from_utf8(payload)
        .map(|s| s.trim() == WATER_NOW)
        .unwrap_or(false)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

/// Valve plus climate. The valve closes on its own after `open_for`.
struct Station {
    sim: ClimateSim,
    open_for: Duration,
    close_at: Option<Instant>,
    started: Instant,
}

impl Station {
    fn new(sim: ClimateSim, open_for: Duration) -> Self {
        Self {
            sim,
            open_for,
            close_at: None,
            started: Instant::now(),
        }
    }

    fn valve_open(&self) -> bool {
        self.close_at.is_some()
    }

    /// Open (or keep open) the valve. Returns true if it was closed.
    fn water_now(&mut self, now: Instant) -> bool {
        let was_closed = self.close_at.is_none();
        self.close_at = Some(now + self.open_for);
        self.sim.set_watering(true);
        was_closed
    }

    /// Returns true if the valve was open.
    fn close(&mut self) -> bool {
        self.sim.set_watering(false);
        self.close_at.take().is_some()
    }

    fn frame(&mut self, now: Instant) -> Frame {
        let s = self.sim.sample(now.duration_since(self.started).as_secs_f64());
        Frame {
            humidity: (s.humidity * 10.0).round() / 10.0,
            temp: (s.temperature * 10.0).round() / 10.0,
            light: s.light_raw,
            valve: if self.valve_open() { "open" } else { "closed" },
        }
    }
}

async fn publish(client: &AsyncClient, topic: &str, frame: &Frame) -> Result<()> {
    let payload = serde_json::to_vec(frame).context("failed to encode frame")?;
    client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await
        .context("publish failed")?;
    debug!(?frame, "published frame");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "alpha".to_string());
    let data_topic =
        env::var("DATA_TOPIC").unwrap_or_else(|_| "plantcare/station/sensors".to_string());
    let command_topic =
        env::var("COMMAND_TOPIC").unwrap_or_else(|_| "plantcare/station/commands".to_string());
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 4);
    let valve_open_s: u64 = env_or("VALVE_OPEN_S", 10);
    let day_length_s: f64 = env_or("DAY_LENGTH_S", 600.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let client_id = format!("plantcare-node-{node_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Commands from the broker are forwarded to the station loop.
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<()>(8);
    let sub_client = client.clone();
    let sub_topic = command_topic.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %sub_topic, "node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(sub_topic.as_str(), QoS::AtLeastOnce) {
                        warn!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if p.topic == sub_topic && is_water_command(&p.payload) {
                        if cmd_tx.send(()).await.is_err() {
                            return;
                        }
                    } else {
                        debug!(topic = %p.topic, "ignoring message");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        %broker,
        port,
        topic = %data_topic,
        %scenario,
        sample_every_s,
        valve_open_s,
        "station emulator running"
    );

    let sim = ClimateSim::new(scenario, day_length_s, fastrand::Rng::new());
    let mut station = Station::new(sim, Duration::from_secs(valve_open_s));
    let mut ticker = interval(Duration::from_secs(sample_every_s.max(1)));

    loop {
        let close_at = station.close_at;
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = cmd_rx.recv() => {
                if station.water_now(Instant::now()) {
                    info!(seconds = valve_open_s, "WATER_NOW received, valve open");
                } else {
                    info!("WATER_NOW received, valve already open, extending");
                    continue;
                }
            }
            _ = async { sleep_until(close_at.unwrap_or_else(Instant::now)).await }, if close_at.is_some() => {
                if station.close() {
                    info!("valve closed");
                }
            }
        }

        let frame = station.frame(Instant::now());
        if let Err(e) = publish(&client, &data_topic, &frame).await {
            warn!("{e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
