//! Local HTTP/WebSocket bridge between a presentation layer and the
//! detection controller.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::acquisition::{ImageAcquisition, Rejection, SubmittedFile};
use crate::config::AppConfig;
use crate::monitor::{ConnectivityMonitor, MonitorSettings};
use crate::predictor::{Predictor, UPLOAD_FIELD};
use crate::types::{ConnectivityState, ImageId, ImageSummary};
use crate::workflow::{DetectionWorkflow, StartOutcome, WorkflowSnapshot};

/// Room for multipart framing on top of the image itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub struct AppState<P> {
    inner: Arc<AppStateInner<P>>,
}

struct AppStateInner<P> {
    monitor: ConnectivityMonitor<P>,
    workflow: DetectionWorkflow<P>,
    acquisition: ImageAcquisition<P>,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Predictor> AppState<P> {
    /// Wires monitor, workflow and acquisition around one predictor. The
    /// monitor is not started.
    pub fn new(predictor: Arc<P>, config: &AppConfig) -> Self {
        let monitor =
            ConnectivityMonitor::new(predictor.clone(), MonitorSettings::from(&config.predictor));
        let workflow = DetectionWorkflow::new(predictor, monitor.subscribe());
        let acquisition = ImageAcquisition::new(workflow.clone(), config.upload.max_image_bytes);
        Self {
            inner: Arc::new(AppStateInner {
                monitor,
                workflow,
                acquisition,
            }),
        }
    }

    pub fn monitor(&self) -> &ConnectivityMonitor<P> {
        &self.inner.monitor
    }

    pub fn workflow(&self) -> &DetectionWorkflow<P> {
        &self.inner.workflow
    }

    pub fn acquisition(&self) -> &ImageAcquisition<P> {
        &self.inner.acquisition
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ConnectivityResponse {
    state: ConnectivityState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum AnalyzeOutcome {
    Started,
    Blocked,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    outcome: AnalyzeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<ImageId>,
    snapshot: WorkflowSnapshot,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Pushed over `/api/ws`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Snapshot(WorkflowSnapshot),
    Connectivity { state: ConnectivityState },
}

pub fn app_router<P: Predictor>(state: AppState<P>) -> Router {
    let body_limit = state.acquisition().max_image_bytes() + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(get_state::<P>))
        .route("/api/connectivity", get(get_connectivity::<P>))
        .route("/api/connectivity/retry", post(retry_connectivity::<P>))
        .route(
            "/api/image",
            post(upload_image::<P>)
                .delete(remove_image::<P>)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/analyze", post(start_analysis::<P>))
        .route("/api/reset", post(reset::<P>))
        .route("/api/ws", any(bridge_ws::<P>))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("no such endpoint: /api/{path}"))
}

async fn get_state<P: Predictor>(State(state): State<AppState<P>>) -> Json<WorkflowSnapshot> {
    Json(state.workflow().snapshot())
}

async fn get_connectivity<P: Predictor>(
    State(state): State<AppState<P>>,
) -> Json<ConnectivityResponse> {
    Json(ConnectivityResponse {
        state: state.monitor().current(),
    })
}

async fn retry_connectivity<P: Predictor>(
    State(state): State<AppState<P>>,
) -> Json<ConnectivityResponse> {
    let state = state.monitor().retry().await;
    Json(ConnectivityResponse { state })
}

async fn upload_image<P: Predictor>(
    State(state): State<AppState<P>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImageSummary>), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(AppError::from_multipart)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let declared_type = match field.content_type() {
            Some(declared) => declared.to_string(),
            None => mime_guess::from_path(&file_name)
                .first_raw()
                .unwrap_or_default()
                .to_string(),
        };
        let bytes = field.bytes().await.map_err(AppError::from_multipart)?;

        let summary = state.acquisition().submit(SubmittedFile::new(
            file_name,
            declared_type,
            bytes.to_vec(),
        ))?;
        return Ok((StatusCode::CREATED, Json(summary)));
    }

    Err(AppError::BadRequest(format!(
        "multipart field `{UPLOAD_FIELD}` is required"
    )))
}

async fn remove_image<P: Predictor>(State(state): State<AppState<P>>) -> Json<WorkflowSnapshot> {
    Json(state.acquisition().remove())
}

async fn start_analysis<P: Predictor>(
    State(state): State<AppState<P>>,
) -> Result<(StatusCode, Json<AnalyzeResponse>), AppError> {
    let workflow = state.workflow();
    let (status, outcome, image_id) = match workflow.start_analysis() {
        StartOutcome::Started(image_id) => {
            (StatusCode::ACCEPTED, AnalyzeOutcome::Started, Some(image_id))
        }
        StartOutcome::Blocked => (StatusCode::OK, AnalyzeOutcome::Blocked, None),
        StartOutcome::Rejected(reason) => return Err(AppError::Conflict(reason.to_string())),
    };

    Ok((
        status,
        Json(AnalyzeResponse {
            outcome,
            image_id,
            snapshot: workflow.snapshot(),
        }),
    ))
}

async fn reset<P: Predictor>(State(state): State<AppState<P>>) -> Json<WorkflowSnapshot> {
    Json(state.workflow().reset())
}

async fn bridge_ws<P: Predictor>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<P>>,
) -> Response {
    let snapshots = state.workflow().subscribe();
    let connectivity = state.monitor().subscribe();
    ws.on_upgrade(move |socket| handle_ws(socket, snapshots, connectivity))
}

async fn handle_ws(
    mut socket: WebSocket,
    mut snapshots: watch::Receiver<WorkflowSnapshot>,
    mut connectivity: watch::Receiver<ConnectivityState>,
) {
    debug!("Bridge WebSocket connected");

    let initial = [
        BridgeEvent::Connectivity {
            state: *connectivity.borrow_and_update(),
        },
        BridgeEvent::Snapshot(snapshots.borrow_and_update().clone()),
    ];
    for event in initial {
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    loop {
        let event = tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                BridgeEvent::Snapshot(snapshots.borrow_and_update().clone())
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                BridgeEvent::Connectivity { state: *connectivity.borrow_and_update() }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => continue,
                }
            }
        };

        if send_event(&mut socket, &event).await.is_err() {
            break;
        }
    }

    debug!("Bridge WebSocket closed");
}

async fn send_event(socket: &mut WebSocket, event: &BridgeEvent) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
}

impl AppError {
    fn from_multipart(error: axum::extract::multipart::MultipartError) -> Self {
        let message = error.body_text();
        if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(message)
        } else {
            AppError::BadRequest(message)
        }
    }
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        let message = rejection.to_string();
        match rejection {
            Rejection::NotAnImage { .. } => AppError::UnsupportedMediaType(message),
            Rejection::TooLarge { .. } => AppError::PayloadTooLarge(message),
            Rejection::Empty | Rejection::Unreadable { .. } => AppError::BadRequest(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::UnsupportedMediaType(msg) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg),
        };

        if status.is_client_error() {
            info!(status = status.as_u16(), error = %message, "Request rejected");
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
