//! HTTP routes and the viewer WebSocket.

use super::broadcast::BroadcastHub;
use super::control::{ControlError, ControlSurface};
use crate::protocol::{
    CommandRequest, CommandResponse, ServerSummary, StartRequest, StopRequest, StreamInfo,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

type AppState = Arc<ControlSurface>;

/// Request failures, rendered as plain-text bodies.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

impl From<ControlError> for HttpError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::ServerNotFound(_) | ControlError::FileNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            ControlError::Conflict(_) => Self::Conflict(err.to_string()),
            ControlError::Connection { .. } | ControlError::Execution { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Build the application router.
///
/// When `static_dir` is set, paths not handled by the API are served from it.
pub fn router(control: Arc<ControlSurface>, static_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(viewer_socket))
        .route("/api/servers", get(list_servers))
        .route("/api/streams", get(list_streams))
        .route("/api/log/start", post(start_stream))
        .route("/api/log/stop", post(stop_stream))
        .route("/api/command", post(run_command))
        .with_state(control)
        .layer(TraceLayer::new_for_http());

    match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn list_servers(State(control): State<AppState>) -> Json<Vec<ServerSummary>> {
    Json(control.config().servers.iter().map(ServerSummary::from).collect())
}

async fn list_streams(State(control): State<AppState>) -> Json<Vec<StreamInfo>> {
    Json(control.streams())
}

async fn start_stream(
    State(control): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<StatusCode, HttpError> {
    let Json(req) = payload?;
    let lines = u32::try_from(req.lines)
        .map_err(|_| HttpError::BadRequest(format!("invalid line count: {}", req.lines)))?;

    control
        .start(&req.server_name, &req.file_alias, lines)
        .await?;
    Ok(StatusCode::OK)
}

async fn stop_stream(
    State(control): State<AppState>,
    payload: Result<Json<StopRequest>, JsonRejection>,
) -> Result<StatusCode, HttpError> {
    let Json(req) = payload?;
    control.stop(&req.server_name, &req.file_alias);
    Ok(StatusCode::OK)
}

async fn run_command(
    State(control): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<CommandResponse>, HttpError> {
    let Json(req) = payload?;
    let output = control.execute(&req.server_name, &req.command).await?;
    Ok(Json(CommandResponse { output }))
}

async fn viewer_socket(ws: WebSocketUpgrade, State(control): State<AppState>) -> Response {
    let hub = control.hub().clone();
    ws.on_upgrade(move |socket| viewer_session(socket, hub))
}

/// Forward hub frames to one viewer until either side goes away.
async fn viewer_session(socket: WebSocket, hub: BroadcastHub) {
    let mut subscription = hub.subscribe();
    let viewer = subscription.id();
    let (mut sender, mut receiver) = socket.split();
    info!(viewer, "viewer connected");

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                let Some(frame) = frame else {
                    // Disconnected by the hub.
                    sender.send(Message::Close(None)).await.ok();
                    break;
                };
                if sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(other)) => debug!(viewer, ?other, "ignoring viewer message"),
            },
        }
    }

    info!(viewer, "viewer disconnected");
}
