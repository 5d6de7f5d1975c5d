use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    coordinator::ScanCoordinator,
    error::ScanError,
    export,
    request::{ScanRequestBuilder, PRESETS},
};

#[derive(Clone)]
pub struct AppState {
    coordinator: ScanCoordinator,
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    /// Free-form flags (and optionally targets), validated against the allow-list.
    #[serde(default)]
    pub args: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ConnectTarget {
    address: String,
}

/// JSON error response with a status chosen by error kind.
pub struct ApiError(ScanError);

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_recoverable() => StatusCode::BAD_REQUEST,
            ScanError::ToolNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ScanError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// API routes for a display layer that polls the coordinator.
pub fn router(coordinator: ScanCoordinator) -> Router {
    let state = AppState { coordinator };

    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/cancel", post(post_cancel))
        .route("/results", get(get_results))
        .route("/hosts/{address}", get(get_host))
        .route("/export/json", get(export_json))
        .route("/export/csv", get(export_csv))
        .route("/connect/{address}", get(get_connect))
        .route("/presets", get(get_presets))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, coordinator: ScanCoordinator) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving scan API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(coordinator)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> Response {
    match app.coordinator.status() {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn post_scan(
    State(app): State<AppState>,
    Json(body): Json<ScanBody>,
) -> Result<Response, ApiError> {
    let mut builder = ScanRequestBuilder::new().targets(body.targets);
    if let Some(preset) = body.preset {
        builder = builder.preset(preset);
    }
    if let Some(args) = body.args.as_deref() {
        builder = builder.args(args);
    }
    let request = builder.build()?;
    let session = app.coordinator.run_scan(request).await?;
    Ok((StatusCode::ACCEPTED, Json(session)).into_response())
}

async fn post_cancel(State(app): State<AppState>) -> Response {
    match app.coordinator.cancel().await {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot = app.coordinator.snapshot();
    (StatusCode::OK, Json(snapshot.as_ref().clone()))
}

async fn get_host(
    State(app): State<AppState>,
    Path(address): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = app.coordinator.snapshot();
    let host = snapshot
        .host(&address)
        .ok_or_else(|| ScanError::NotFound(address.clone()))?;
    Ok((StatusCode::OK, Json(host.summary())).into_response())
}

async fn export_json(State(app): State<AppState>) -> Result<Response, ApiError> {
    let body = app.coordinator.export_json()?;
    Ok(attachment(body, "application/json", "json"))
}

async fn export_csv(State(app): State<AppState>) -> Result<Response, ApiError> {
    let body = app.coordinator.export_csv()?;
    Ok(attachment(body, "text/csv; charset=utf-8", "csv"))
}

async fn get_connect(
    State(app): State<AppState>,
    Path(address): Path<String>,
) -> Result<Response, ApiError> {
    let address = app.coordinator.resolve_connect_target(&address)?;
    Ok((StatusCode::OK, Json(ConnectTarget { address })).into_response())
}

async fn get_presets() -> impl IntoResponse {
    Json(PRESETS)
}

fn attachment(body: Vec<u8>, content_type: &'static str, ext: &str) -> Response {
    let filename = export::default_filename(ext, OffsetDateTime::now_utc());
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}
