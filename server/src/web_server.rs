//! Axum HTTP + WebSocket surface. Thin transport over the core manager:
//! model discovery, session create/stop, download jobs, admin cache clear,
//! the /events/{sid} push channel, and read-only /out static serving.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use common::config::Config;
use common::error::ControlError;
use common::models::{list_asr_models, list_mt_models, mt_supported_languages, CapabilityProbe};
use common::supervisor::{SessionConfig, SessionId, SessionManager};

/// Shared app state: the manager, the capability probe, and the admin token.
#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    probe: Arc<CapabilityProbe>,
    admin_token: Option<String>,
}

/// POST /models/download body.
#[derive(serde::Deserialize)]
struct DownloadBody {
    repo_id: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Optional first client frame on /events/{sid}.
#[derive(serde::Deserialize)]
struct ResumeFrame {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    last_seq: u64,
}

fn detail(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "detail": message.into() })))
}

fn error_response(e: ControlError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        ControlError::Config(_) | ControlError::Admission(_) => StatusCode::BAD_REQUEST,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    detail(status, e.to_string())
}

/// Build the router. Split from [`run_web_server`] so tests can serve it on an
/// ephemeral port.
pub fn build_app(manager: Arc<SessionManager>, probe: Arc<CapabilityProbe>, admin_token: Option<String>) -> Router {
    let out_dir = manager.options().out_root.clone();
    let state = AppState { manager, probe, admin_token };

    Router::new()
        .route("/models/asr", get(list_asr_handler))
        .route("/models/mt", get(list_mt_handler))
        .route("/languages/mt/{model_id}", get(mt_languages_handler))
        .route("/models/asr/{name}/capabilities", get(asr_capabilities_handler))
        .route("/models/download", post(download_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions/{sid}", delete(stop_session_handler))
        .route("/admin/cache/clear", post(cache_clear_handler))
        .route("/events/{sid}", get(events_ws_handler))
        .nest_service("/out", ServeDir::new(out_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until it fails. Binds 0.0.0.0 so LAN clients can subscribe.
pub async fn run_web_server(
    cfg: &Config,
    manager: Arc<SessionManager>,
    probe: Arc<CapabilityProbe>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(&cfg.out_dir)?;
    let app = build_app(manager, probe, cfg.admin_token.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("[LiveCap] API listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_asr_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = list_asr_models(&state.manager.options().model_dir);
    Json(serde_json::to_value(models).unwrap_or_default())
}

async fn list_mt_handler() -> Json<serde_json::Value> {
    Json(serde_json::to_value(list_mt_models()).unwrap_or_default())
}

async fn mt_languages_handler(Path(model_id): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "model_id": model_id,
        "languages": mt_supported_languages(&model_id),
    }))
}

async fn asr_capabilities_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let local = state.manager.options().model_dir.join(&name);
    let model_path = local.is_dir().then_some(local);
    let report = state.probe.probe(&name, model_path.as_deref());
    Json(serde_json::to_value(report).unwrap_or_default())
}

async fn download_handler(
    State(state): State<AppState>,
    Json(body): Json<DownloadBody>,
) -> Json<serde_json::Value> {
    let job_id = state.manager.clone().start_download(&body.repo_id, &body.kind);
    Json(serde_json::json!({ "job_id": job_id, "status": "started" }))
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(cfg): Json<SessionConfig>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.manager.start_session(cfg) {
        Ok(sid) => Ok(Json(serde_json::json!({ "session_id": sid.to_string() }))),
        Err(e) => Err(error_response(e)),
    }
}

async fn stop_session_handler(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let id = SessionId::parse(&sid)
        .ok_or_else(|| detail(StatusCode::NOT_FOUND, "session not found"))?;
    match state.manager.stop_session(id) {
        Ok(()) => Ok(Json(serde_json::json!({ "stopped": true }))),
        Err(e) => Err(error_response(e)),
    }
}

async fn cache_clear_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let Some(provided) = provided else {
        return Err(detail(StatusCode::UNAUTHORIZED, "missing bearer token"));
    };
    match &state.admin_token {
        Some(expected) if expected == provided => {
            let cleared = state.probe.clear();
            println!("[LiveCap] capability cache cleared ({cleared} entries)");
            Ok(Json(serde_json::json!({ "cleared": cleared })))
        }
        _ => Err(detail(StatusCode::FORBIDDEN, "invalid admin token")),
    }
}

async fn events_ws_handler(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| handle_events_socket(socket, sid, manager))
        .into_response()
}

/// One push connection. The hub queues frames (hello first); this task drains
/// them to the peer and watches for the optional resume frame. A send failure
/// or hub eviction ends the connection; other client frames are ignored.
async fn handle_events_socket(mut socket: WebSocket, sid: String, manager: Arc<SessionManager>) {
    let hub = manager.hub().clone();
    let mut sub = hub.subscribe(&sid);

    'conn: loop {
        tokio::select! {
            frame = sub.rx.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break 'conn;
                        }
                    }
                    // Evicted by the hub (slow or replaced); close out.
                    None => break 'conn,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let resume = serde_json::from_str::<ResumeFrame>(&text)
                            .ok()
                            .filter(|r| r.ty == "resume");
                        if let Some(resume) = resume {
                            let session = SessionId::parse(&sid).and_then(|id| manager.get(id));
                            if let Some(session) = session {
                                for env in session.replay_after(resume.last_seq) {
                                    let Ok(frame) = serde_json::to_string(&env) else { continue };
                                    if socket.send(Message::Text(frame.into())).await.is_err() {
                                        break 'conn;
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break 'conn,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break 'conn,
                }
            }
        }
    }

    hub.unsubscribe(&sid, sub.id);
}
