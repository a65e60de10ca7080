//! HTTP surface for Matchday: sync trigger and fixture read endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use matchday_core::PersistedFixture;
use matchday_storage::FixtureStore;
use matchday_sync::{RunError, SyncPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "matchday-web";

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub trigger_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, trigger_token: Option<String>) -> Self {
        Self {
            pipeline,
            trigger_token: trigger_token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub message: String,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FixturesResponse {
    pub count: usize,
    pub fixtures: Vec<PersistedFixture>,
}

#[derive(Debug, Deserialize, Default)]
struct FixturesQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", get(sync_handler).post(sync_handler))
        .route("/api/fixtures", get(fixtures_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_response(status: StatusCode, error: &'static str, detail: Option<String>) -> Response {
    (status, Json(ErrorBody { error, detail })).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::trim)
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.trigger_token.as_deref() else {
        warn!("SYNC_TRIGGER_TOKEN is not set; rejecting sync trigger");
        return false;
    };
    bearer_token(headers).is_some_and(|given| given == expected)
}

async fn sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", None);
    }

    match state.pipeline.run_once().await {
        Ok(summary) => Json(SyncResponse {
            message: format!(
                "synced {} fixtures ({} of {} days failed)",
                summary.persisted,
                summary.failed_days.len(),
                summary.days_requested
            ),
            count: summary.persisted,
            timestamp: summary.finished_at,
        })
        .into_response(),
        Err(RunError::AlreadyRunning) => {
            error_response(StatusCode::CONFLICT, "already_running", None)
        }
        Err(RunError::Configuration(err)) => error_response(
            StatusCode::BAD_REQUEST,
            "configuration",
            Some(err.to_string()),
        ),
        Err(RunError::Storage(err)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage",
            Some(err.to_string()),
        ),
    }
}

async fn fixtures_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FixturesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    match state.pipeline.store().list_upcoming(limit).await {
        Ok(fixtures) => Json(FixturesResponse {
            count: fixtures.len(),
            fixtures,
        })
        .into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage",
            Some(err.to_string()),
        ),
    }
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
