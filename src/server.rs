//! HTTP and WebSocket transport for the stream engine.
//!
//! This module provides an HTTP server that:
//! - Accepts one depth sample per compression via POST /ingest
//! - Classifies whole windows directly via POST /predict and /predict/batch
//! - Streams session events to WebSocket observers on /ws/{session_id}
//!
//! # Architecture
//!
//! ```text
//! Device ──→ POST /ingest ──→ StreamEngine ──→ EventHub ──→ /ws/{session} observers
//!                                  ↓
//!                           [Window + Classify]
//! ```

use crate::config::Config;
use crate::core::inference::InferenceResult;
use crate::core::windowing::{WindowMode, WINDOW_SIZE};
use crate::engine::{EngineError, HistorySnapshot, IngestOutcome, LastResult, Sample, StreamEngine};
use crate::stats::StatsSnapshot;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::{Html, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Shared server state
pub struct AppState {
    engine: StreamEngine,
    config: Config,
}

impl AppState {
    pub fn new(engine: StreamEngine, config: Config) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }
}

fn default_session() -> String {
    "default".to_string()
}

fn default_limit() -> usize {
    50
}

/// Body of POST /predict
#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    #[serde(default = "default_session")]
    pub session_id: String,
    pub depth_cm: Vec<f32>,
}

/// Body of POST /predict/batch
#[derive(Debug, Clone, Deserialize)]
pub struct PredictBatchRequest {
    #[serde(default = "default_session")]
    pub session_id: String,
    pub batches: Vec<Vec<f32>>,
}

/// Body of POST /ingest
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    #[serde(default = "default_session")]
    pub session_id: String,
    pub depth_cm: f64,
    /// "sliding" | "nonoverlap" (optional)
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModeQuery {
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetModeQuery {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct UiQuery {
    #[serde(default = "default_session")]
    pub session_id: String,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub session_id: String,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub results: Vec<InferenceResult>,
}

#[derive(Serialize)]
pub struct LastResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub last: LastResult,
}

#[derive(Serialize)]
pub struct DepthResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub history: HistorySnapshot,
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub ok: bool,
    pub session_id: String,
    pub message: String,
    pub total_compressions_before_reset: usize,
}

#[derive(Serialize)]
pub struct SetModeResponse {
    pub ok: bool,
    pub session_id: String,
    pub old_mode: WindowMode,
    pub new_mode: WindowMode,
    pub message: String,
}

#[derive(Serialize)]
pub struct ModeResponse {
    pub session_id: String,
    pub mode: WindowMode,
    pub available_modes: [&'static str; 2],
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model_path: String,
    pub window_size: usize,
    pub cors: Vec<String>,
    pub sessions: usize,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn bad_request(error: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error,
            code: "INVALID_PAYLOAD".to_string(),
        }),
    )
}

fn engine_error(e: EngineError) -> ApiError {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| bad_request(format!("Invalid payload: {}", e.body_text())))
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_path: state.config.model_path.display().to_string(),
        window_size: WINDOW_SIZE,
        cors: state.config.cors_origins.clone(),
        sessions: state.engine.session_count().await,
    })
}

/// GET /stats
async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.engine.stats())
}

/// POST /predict
async fn predict(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> ApiResult<InferenceResult> {
    let req = json_body(payload)?;
    let result = state
        .engine
        .predict(&req.session_id, req.depth_cm)
        .await
        .map_err(engine_error)?;
    Ok(Json(result))
}

/// POST /predict/batch
async fn predict_batch(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PredictBatchRequest>, JsonRejection>,
) -> ApiResult<BatchResponse> {
    let req = json_body(payload)?;
    let results = state
        .engine
        .predict_batch(&req.session_id, req.batches)
        .await
        .map_err(engine_error)?;
    Ok(Json(BatchResponse { results }))
}

/// POST /ingest
///
/// One depth value (cm) per compression. The `mode` query parameter
/// overrides the mode in the body.
async fn ingest(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ModeQuery>, QueryRejection>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> ApiResult<IngestResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let req = json_body(payload)?;

    let sample = Sample {
        depth_cm: req.depth_cm,
        mode: req.mode,
    };
    let outcome = state
        .engine
        .ingest(&req.session_id, sample, query.mode.as_deref())
        .await
        .map_err(engine_error)?;

    Ok(Json(IngestResponse {
        ok: true,
        session_id: req.session_id,
        outcome,
    }))
}

/// GET /last/{session_id}
async fn last(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<LastResponse> {
    let last = state.engine.get_last(&session_id).await;
    Json(LastResponse { session_id, last })
}

/// GET /depth/{session_id}?limit=50
async fn depth(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<DepthResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let history = state.engine.get_history(&session_id, query.limit).await;
    Ok(Json(DepthResponse {
        session_id,
        history,
    }))
}

/// POST /reset/{session_id}
async fn reset(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<ResetResponse> {
    let before = state.engine.reset(&session_id).await;
    Json(ResetResponse {
        ok: true,
        session_id,
        message: "Session reset".to_string(),
        total_compressions_before_reset: before,
    })
}

/// POST /mode/{session_id}?mode=sliding|nonoverlap
async fn set_mode(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    query: Result<Query<SetModeQuery>, QueryRejection>,
) -> ApiResult<SetModeResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let change = state
        .engine
        .set_mode(&session_id, &query.mode)
        .await
        .map_err(engine_error)?;

    Ok(Json(SetModeResponse {
        ok: true,
        session_id,
        old_mode: change.old_mode,
        new_mode: change.new_mode,
        message: format!("Mode changed to {}", change.new_mode),
    }))
}

/// GET /mode/{session_id}
async fn get_mode(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<ModeResponse> {
    let mode = state.engine.get_mode(&session_id).await;
    Json(ModeResponse {
        session_id,
        mode,
        available_modes: WindowMode::AVAILABLE,
    })
}

/// GET /ws/{session_id}
async fn ws_observe(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| observe(socket, state, session_id))
}

/// Forward session events to one WebSocket until either side goes away.
async fn observe(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let mut subscription = state.engine.subscribe(&session_id).await;
    tracing::info!(session_id = %session_id, observer = %subscription.id, "WebSocket observer connected");

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to serialize {} event: {}", event.kind(), e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Keep-alive traffic from the client is ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state
        .engine
        .unsubscribe(&session_id, subscription.id)
        .await;
    tracing::info!(session_id = %session_id, "WebSocket observer disconnected");
}

/// GET /ui?session_id=...
async fn ui(query: Result<Query<UiQuery>, QueryRejection>) -> Html<String> {
    let session_id = query
        .map(|Query(q)| q.session_id)
        .unwrap_or_else(|_| default_session());
    Html(monitor_page(&session_id))
}

/// Minimal live monitor page for one session.
fn monitor_page(session_id: &str) -> String {
    let session_id: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();

    format!(
        r#"<!doctype html>
<meta charset="utf-8"/>
<title>CPR Monitor - {session_id}</title>
<body style="font-family: system-ui, sans-serif; max-width: 640px; margin: 2rem auto;">
  <h2>CPR Monitor - session: <code>{session_id}</code></h2>
  <pre id="log" style="padding:1rem;border:1px solid #ccc;border-radius:8px;white-space:pre-wrap;"></pre>
  <script>
    const el = document.getElementById('log');
    const ws = new WebSocket(`ws://${{location.host}}/ws/{session_id}`);
    ws.onopen = () => el.textContent += 'WS connected\n';
    ws.onmessage = (e) => {{
      const m = JSON.parse(e.data);
      if (m.type === 'inference') {{
        el.textContent =
          'Label: ' + m.class_label + '\n' +
          'Index: ' + m.class_index + '\n' +
          'Probs: ' + JSON.stringify(m.probs) + '\n';
      }}
    }};
    ws.onerror = () => el.textContent += 'WS error\n';
    ws.onclose = () => el.textContent += 'WS closed\n';
  </script>
</body>
"#
    )
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.allows_any_origin() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Build the router for the given state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/ingest", post(ingest))
        .route("/last/:session_id", get(last))
        .route("/depth/:session_id", get(depth))
        .route("/reset/:session_id", post(reset))
        .route("/mode/:session_id", post(set_mode).get(get_mode))
        .route("/ws/:session_id", get(ws_observe))
        .route("/ui", get(ui))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: Config,
    engine: StreamEngine,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let actual_addr = listener.local_addr()?;

    let state = Arc::new(AppState::new(engine, config));
    let app = router(state);

    tracing::info!("CPR stream agent listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_page_sanitizes_session() {
        let page = monitor_page("s1<script>");
        assert!(page.contains("session: <code>s1script</code>"));
        assert!(page.contains("/ws/s1script"));
    }

    #[test]
    fn test_engine_error_status() {
        let (status, body) = engine_error(EngineError::Validation("bad".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "INVALID_PAYLOAD");

        let (status, body) = engine_error(EngineError::ModelShape("3-D".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code, "MODEL_OUTPUT");
    }
}
