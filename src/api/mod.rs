//! # API Façade
//!
//! The thin HTTP surface the CLI talks to. Submission, lookup, state,
//! events — nothing the core does not already expose through the
//! controller. A `/livez` endpoint doubles as the metrics listener's
//! only route.

pub mod client;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::ApiConfig;
use crate::controller::Controller;
use crate::job::{Job, JobDeal, JobEvent, JobLocalEvent, JobSpec, JobState};
use crate::shutdown::Shutdown;
use crate::store::JobListFilter;
use crate::types::{ClientId, FlotillaError, FlotillaResult, JobId};

pub use client::ApiClient;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
}

/// Submission request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub spec: JobSpec,
    pub deal: JobDeal,
    #[serde(default)]
    pub client_id: String,
}

/// Submission response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job: Job,
}

/// Build the API router.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v0/submit", post(submit_job))
        .route("/api/v0/jobs/:id", get(get_job))
        .route("/api/v0/jobs/:id/state", get(get_job_state))
        .route("/api/v0/jobs/:id/events", get(get_job_events))
        .route("/api/v0/jobs/:id/local_events", get(get_job_local_events))
        .route("/livez", get(livez))
        .with_state(state)
}

/// Bind and serve until the token cancels. Returns the bound address, so
/// callers (and tests) can ask for port 0.
pub async fn serve_api(
    config: &ApiConfig,
    state: ApiState,
    shutdown: Shutdown,
) -> FlotillaResult<SocketAddr> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!("api server listening on {}", local_addr);

    let router = api_router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("api server failed: {}", e);
        }
    });
    Ok(local_addr)
}

/// Serve only `/livez` (the metrics listener).
pub async fn serve_livez(port: u16, shutdown: Shutdown) -> FlotillaResult<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;
    info!("liveness listener on {}", local_addr);
    let router = Router::new().route("/livez", get(livez));
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("liveness listener failed: {}", e);
        }
    });
    Ok(local_addr)
}

async fn livez() -> &'static str {
    "OK"
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let job = state
        .controller
        .submit(payload.spec, payload.deal, ClientId::new(payload.client_id))
        .await
        .map_err(internal_error)?;
    Ok(Json(SubmitResponse { job }))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let job_id = resolve_job_id(&state, &id).await?;
    let job = state
        .controller
        .get_job(job_id)
        .await
        .map_err(status_for_error)?;
    Ok(Json(job))
}

async fn get_job_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobState>, (StatusCode, String)> {
    let job_id = resolve_job_id(&state, &id).await?;
    let job_state = state
        .controller
        .get_job_state(job_id)
        .await
        .map_err(status_for_error)?;
    Ok(Json(job_state))
}

async fn get_job_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobEvent>>, (StatusCode, String)> {
    let job_id = resolve_job_id(&state, &id).await?;
    let events = state
        .controller
        .get_events(job_id)
        .await
        .map_err(status_for_error)?;
    Ok(Json(events))
}

async fn get_job_local_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobLocalEvent>>, (StatusCode, String)> {
    let job_id = resolve_job_id(&state, &id).await?;
    let events = state
        .controller
        .get_local_events(job_id)
        .await
        .map_err(status_for_error)?;
    Ok(Json(events))
}

/// Accept both full and short-form job ids.
async fn resolve_job_id(state: &ApiState, raw: &str) -> Result<JobId, (StatusCode, String)> {
    if let Ok(id) = raw.parse::<JobId>() {
        return Ok(id);
    }
    let matches = state
        .controller
        .get_jobs(&JobListFilter {
            id_prefix: Some(raw.to_string()),
            ..Default::default()
        })
        .await
        .map_err(internal_error)?;
    match matches.len() {
        0 => Err((StatusCode::NOT_FOUND, format!("no job matching {:?}", raw))),
        1 => Ok(matches[0].id),
        n => Err((
            StatusCode::BAD_REQUEST,
            format!("{} jobs match {:?}, use a longer id", n, raw),
        )),
    }
}

fn status_for_error(e: FlotillaError) -> (StatusCode, String) {
    match e {
        FlotillaError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        FlotillaError::BadSpec(_) | FlotillaError::BadResourceSpec(_) => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn internal_error(e: FlotillaError) -> (StatusCode, String) {
    status_for_error(e)
}
