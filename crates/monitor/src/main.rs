mod advisory;
mod care;
mod config;
mod connectivity;
mod history;
mod irrigation;
mod mqtt;
mod reading;
mod session;
mod sim;
mod source;
mod state;
mod thirst;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use session::{Runtime, Session};
use state::{EventKind, SystemState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        devices = cfg.devices.len(),
        transport = %cfg.session.transport,
        mode = %cfg.irrigation.mode,
        "config loaded"
    );

    // ── Advisory collaborator ───────────────────────────────────────
    let advisor = advisory::from_settings(&cfg.advisory)?;
    if cfg.advisory.base_url.trim().is_empty() {
        info!("advisory collaborator disabled, using built-in defaults");
    }

    // ── Session + shared state (ephemeral, for the web api) ─────────
    let session = Session::new(&cfg)?;
    let shared = Arc::new(RwLock::new(SystemState::new(
        session.snapshot(),
        cfg.devices.clone(),
    )));
    shared
        .write()
        .await
        .record(EventKind::System, "monitor started".to_string());

    let (tx, rx) = mpsc::channel(256);

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        commands: tx.clone(),
        advisor: Arc::clone(&advisor),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web api stopped: {e:#}");
        }
    });

    // ── Session loop ────────────────────────────────────────────────
    let rt = Runtime {
        shared,
        advisor,
        mqtt: cfg.mqtt.clone(),
        sample_every: Duration::from_millis(cfg.simulation.sample_every_ms),
        evaluate_every: Duration::from_secs(cfg.session.evaluate_every_sec),
    };
    session::run(session, rt, tx, rx).await;

    Ok(())
}
