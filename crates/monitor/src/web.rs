use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::advisory::{self, Advisor, MIN_HEALTH_READINGS};
use crate::irrigation::WateringMode;
use crate::session::SessionEvent;
use crate::source::TransportMode;
use crate::state::{EventKind, SharedState};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub commands: mpsc::Sender<SessionEvent>,
    pub advisor: Arc<dyn Advisor>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/devices", get(api_devices))
        .route("/api/water", post(api_water))
        .route("/api/mode", post(api_mode))
        .route("/api/mode/toggle", post(api_mode_toggle))
        .route("/api/device", post(api_device))
        .route("/api/transport", post(api_transport))
        .route("/api/health-report", post(api_health_report))
        .route("/api/fact", get(api_fact))
        .with_state(state)
}

#[derive(Deserialize)]
struct ModeBody {
    mode: WateringMode,
}

#[derive(Deserialize)]
struct DeviceBody {
    id: String,
}

#[derive(Deserialize)]
struct TransportBody {
    mode: TransportMode,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Hand an event to the session loop. Control endpoints never wait for it
/// to be processed.
async fn enqueue(state: &AppState, event: SessionEvent) -> Response {
    match state.commands.send(event).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response(),
        Err(e) => {
            warn!("web: session loop gone: {e}");
            error(StatusCode::SERVICE_UNAVAILABLE, "session is not running")
        }
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status(Utc::now()))
}

async fn api_history(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.history().to_vec())
}

async fn api_devices(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(json!({
        "active": st.snapshot().device.id,
        "devices": st.devices(),
    }))
}

async fn api_water(State(state): State<AppState>) -> Response {
    enqueue(&state, SessionEvent::WaterRequested).await
}

async fn api_mode(State(state): State<AppState>, Json(body): Json<ModeBody>) -> Response {
    enqueue(&state, SessionEvent::ModeSelected(body.mode)).await
}

async fn api_mode_toggle(State(state): State<AppState>) -> Response {
    enqueue(&state, SessionEvent::ModeToggled).await
}

async fn api_device(State(state): State<AppState>, Json(body): Json<DeviceBody>) -> Response {
    let known = {
        let st = state.shared.read().await;
        st.devices().iter().any(|d| d.id == body.id)
    };
    if !known {
        return error(StatusCode::NOT_FOUND, format!("unknown device '{}'", body.id));
    }
    enqueue(&state, SessionEvent::DeviceSwitched(body.id)).await
}

async fn api_transport(
    State(state): State<AppState>,
    Json(body): Json<TransportBody>,
) -> Response {
    enqueue(&state, SessionEvent::TransportSwitched(body.mode)).await
}

async fn api_health_report(State(state): State<AppState>) -> Response {
    // Copy out and release the lock before awaiting the collaborator.
    let (readings, profile) = {
        let st = state.shared.read().await;
        (st.history().to_vec(), st.snapshot().profile.clone())
    };

    let Some(report) =
        advisory::health_report_or_default(state.advisor.as_ref(), &readings, profile.as_ref())
            .await
    else {
        return error(
            StatusCode::CONFLICT,
            format!(
                "need at least {MIN_HEALTH_READINGS} readings, have {}",
                readings.len()
            ),
        );
    };

    state
        .shared
        .write()
        .await
        .record(EventKind::Advisory, format!("health report: {}", report.summary));
    Json(report).into_response()
}

async fn api_fact(State(state): State<AppState>) -> impl IntoResponse {
    Json(advisory::fact_or_default(state.advisor.as_ref()).await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{OfflineAdvisor, StaticAdvisor};
    use crate::care::CareProfile;
    use crate::config::{Config, Device};
    use crate::reading::{Reading, ValveState};
    use crate::session::Session;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn device(id: &str, species: &str) -> Device {
        Device {
            id: id.into(),
            name: format!("{id} node"),
            species: species.into(),
            location: String::new(),
            kind: String::new(),
            data_topic: None,
            command_topic: None,
        }
    }

    fn app_with(advisor: Arc<dyn Advisor>) -> (Router, SharedState, mpsc::Receiver<SessionEvent>) {
        let cfg = Config {
            devices: vec![device("alpha", "Snake Plant"), device("beta-demo", "Bird of Paradise")],
            ..Config::default()
        };
        let session = Session::new(&cfg).unwrap();
        let shared = Arc::new(RwLock::new(SystemState::new(
            session.snapshot(),
            cfg.devices.clone(),
        )));
        let (tx, rx) = mpsc::channel(8);
        let app = router(AppState {
            shared: Arc::clone(&shared),
            commands: tx,
            advisor,
        });
        (app, shared, rx)
    }

    fn app() -> (Router, SharedState, mpsc::Receiver<SessionEvent>) {
        app_with(Arc::new(OfflineAdvisor))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -- read endpoints -----------------------------------------------------

    #[tokio::test]
    async fn status_reports_session() {
        let (app, _, _rx) = app();
        let resp = app.oneshot(get_req("/api/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["device"]["id"], "alpha");
        assert_eq!(json["lastWatered"], "Never");
        assert!(json["hoursSinceWatering"].is_null());
        assert_eq!(json["thirst"]["isThirsty"], false);
        assert_eq!(json["thirst"]["elevated"], false);
    }

    #[tokio::test]
    async fn history_returns_readings() {
        let (app, shared, _rx) = app();
        {
            let mut st = shared.write().await;
            let snap = st.snapshot().clone();
            st.publish(
                snap,
                vec![Reading::new(40.0, 21.0, 60.0, ValveState::Closed, Utc::now())],
            );
        }
        let resp = app.oneshot(get_req("/api/history")).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json.as_array().map(Vec::len), Some(1));
        assert_eq!(json[0]["lightLevel"], 60.0);
    }

    #[tokio::test]
    async fn devices_lists_registry() {
        let (app, _, _rx) = app();
        let json = body_json(app.oneshot(get_req("/api/devices")).await.unwrap()).await;
        assert_eq!(json["active"], "alpha");
        assert_eq!(json["devices"].as_array().map(Vec::len), Some(2));
    }

    // -- control endpoints --------------------------------------------------

    #[tokio::test]
    async fn water_enqueues_request() {
        let (app, _, mut rx) = app();
        let resp = app.oneshot(post_empty("/api/water")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::WaterRequested)));
    }

    #[tokio::test]
    async fn mode_select_and_toggle() {
        let (app, _, mut rx) = app();
        let resp = app
            .clone()
            .oneshot(post_json("/api/mode", json!({ "mode": "autonomous" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::ModeSelected(WateringMode::Autonomous))
        ));

        let resp = app.oneshot(post_empty("/api/mode/toggle")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ModeToggled)));
    }

    #[tokio::test]
    async fn invalid_mode_rejected() {
        let (app, _, mut rx) = app();
        let resp = app
            .oneshot(post_json("/api/mode", json!({ "mode": "sometimes" })))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn device_switch_enqueued_for_known_device() {
        let (app, _, mut rx) = app();
        let resp = app
            .oneshot(post_json("/api/device", json!({ "id": "beta-demo" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        match rx.try_recv() {
            Ok(SessionEvent::DeviceSwitched(id)) => assert_eq!(id, "beta-demo"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_device_is_404() {
        let (app, _, mut rx) = app();
        let resp = app
            .oneshot(post_json("/api/device", json!({ "id": "gamma" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_switch_enqueued() {
        let (app, _, mut rx) = app();
        let resp = app
            .oneshot(post_json("/api/transport", json!({ "mode": "live" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::TransportSwitched(TransportMode::Live))
        ));
    }

    #[tokio::test]
    async fn closed_session_is_503() {
        let (app, _, rx) = app();
        drop(rx);
        let resp = app.oneshot(post_empty("/api/water")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    // -- advisory endpoints -------------------------------------------------

    #[tokio::test]
    async fn health_report_needs_readings() {
        let (app, _, _rx) = app();
        let resp = app.oneshot(post_empty("/api/health-report")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn health_report_uses_advisor_and_journals() {
        let (app, shared, _rx) =
            app_with(Arc::new(StaticAdvisor::new(CareProfile::fallback("Snake Plant"))));
        {
            let mut st = shared.write().await;
            let snap = st.snapshot().clone();
            let now = Utc::now();
            let readings = (0..4)
                .map(|_| Reading::new(50.0, 22.0, 50.0, ValveState::Closed, now))
                .collect();
            st.publish(snap, readings);
        }
        let resp = app.oneshot(post_empty("/api/health-report")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["summary"].is_string());

        let status = shared.read().await.to_status(Utc::now());
        assert!(status
            .events
            .iter()
            .any(|e| e.kind == EventKind::Advisory && e.detail.starts_with("health report")));
    }

    #[tokio::test]
    async fn fact_falls_back_offline() {
        let (app, _, _rx) = app();
        let json = body_json(app.oneshot(get_req("/api/fact")).await.unwrap()).await;
        assert_eq!(json["fact"], "Plants are vital for life.");
        assert_eq!(json["category"], "General");
    }
}
