//! Axum JSON surface for the sync triggers, run history, link health and
//! social page lifecycle.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use evsync_core::{MetroSet, PageStatus};
use evsync_storage::{Store, StoreError};
use evsync_sync::{LifecycleError, NewPage, RunRequest, SyncEngine, SyncError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "evsync-web";

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub metros: MetroSet,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, metros: MetroSet) -> Self {
        Self { engine, metros }
    }
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PagesQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewPageBody {
    url: String,
    #[serde(default)]
    display_name: String,
    metro_slug: String,
    #[serde(default)]
    venue_id: Option<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync/events", post(sync_events_handler))
        .route("/sync/venues", post(sync_venues_handler))
        .route("/links/check", post(links_check_handler))
        .route("/runs", get(runs_handler))
        .route("/pages", get(pages_handler).post(register_page_handler))
        .route("/pages/{id}", get(page_handler).delete(delete_page_handler))
        .route("/pages/{id}/activate", post(activate_page_handler))
        .route("/pages/{id}/pause", post(pause_page_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving sync triggers");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match err {
        SyncError::RunInProgress { .. } => StatusCode::CONFLICT,
        SyncError::Initialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(status, err.to_string())
}

fn lifecycle_error(err: LifecycleError) -> Response {
    let status = match &err {
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::InvalidTransition { .. } => StatusCode::CONFLICT,
        LifecycleError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LifecycleError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Trigger bodies are optional; an empty body means the default metro and source sets.
fn run_request(body: &Bytes) -> Result<RunRequest, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, format!("invalid run request: {err}")))
}

async fn sync_events_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match run_request(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.engine.run_event_sync(&state.metros, &request).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sync_venues_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match run_request(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.engine.run_venue_discovery(&state.metros, &request).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn links_check_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.check_links().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.engine.store().list_run_logs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn pages_handler(State(state): State<Arc<AppState>>, Query(query): Query<PagesQuery>) -> Response {
    let status = match query.status.as_deref().map(str::parse::<PageStatus>).transpose() {
        Ok(status) => status,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };
    match state.engine.lifecycle().list_pages(status).await {
        Ok(pages) => Json(pages).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

async fn register_page_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewPageBody>,
) -> Response {
    let new = NewPage {
        url: body.url,
        display_name: body.display_name,
        metro_slug: body.metro_slug,
        venue_id: body.venue_id,
    };
    match state.engine.lifecycle().register_page(new).await {
        Ok(page) => (StatusCode::CREATED, Json(page)).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

async fn page_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.engine.lifecycle().page(id).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

async fn activate_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.engine.lifecycle().activate(id).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

async fn pause_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.engine.lifecycle().pause(id).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => lifecycle_error(err),
    }
}

async fn delete_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.engine.lifecycle().delete_page(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => lifecycle_error(err),
    }
}
