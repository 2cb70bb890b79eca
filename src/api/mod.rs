//! Status query API consumed by the dashboard.
//!
//! Routes:
//! - `GET /health`
//! - `GET /api/status`
//! - `GET /api/metrics?window=24h`
//! - `GET /api/reports?cadence=daily&limit=10`
//! - `GET /api/report/{cadence}/{calendar_key}`
//!
//! A store that cannot be read yields 503 with an explicit error, never
//! stale or fabricated data.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::error::StoreError;
use crate::status::{self, StatusAggregator};
use crate::worker::descriptor::Cadence;

/// Default number of report references returned.
pub const DEFAULT_REPORT_LIMIT: usize = 10;

/// Upper bound for any `limit` parameter.
pub const MAX_LIMIT: usize = 500;

/// Shared state for API routes.
#[derive(Clone)]
pub struct ApiState {
    pub status: Arc<StatusAggregator>,
}

/// Build the API router with CORS enabled for the dashboard client.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/metrics", get(get_metrics))
        .route("/api/reports", get(list_reports))
        .route("/api/report/{cadence}/{calendar_key}", get(get_report))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ai-agents",
    }))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

fn store_unavailable(e: StoreError) -> Response {
    tracing::error!(error = %e, "Status query failed");
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        format!("store unavailable: {e}"),
    )
}

/// GET /api/status
///
/// Per-worker derived state and overall system health.
async fn get_status(State(state): State<ApiState>) -> Response {
    match state.status.get_status().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => store_unavailable(e),
    }
}

#[derive(Debug, Deserialize)]
struct MetricsParams {
    window: Option<String>,
}

/// GET /api/metrics?window=
///
/// Latest value and aggregates per metric name, plus recent raw events.
async fn get_metrics(
    State(state): State<ApiState>,
    Query(params): Query<MetricsParams>,
) -> Response {
    let window = match params.window.as_deref() {
        Some(raw) => match status::parse_window(raw) {
            Ok(window) => window,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => status::DEFAULT_WINDOW,
    };
    match state.status.get_metrics_summary(window).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => store_unavailable(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReportsParams {
    cadence: Option<String>,
    limit: Option<usize>,
}

/// GET /api/reports?cadence=&limit=
///
/// Report references, newest first.
async fn list_reports(
    State(state): State<ApiState>,
    Query(params): Query<ReportsParams>,
) -> Response {
    let cadence = match params.cadence.as_deref().map(str::parse::<Cadence>) {
        None => None,
        Some(Ok(cadence)) => Some(cadence),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_REPORT_LIMIT)
        .clamp(1, MAX_LIMIT);

    match state.status.list_reports(cadence, limit).await {
        Ok(reports) => Json(serde_json::json!({
            "reports": reports,
            "count": reports.len(),
        }))
        .into_response(),
        Err(e) => store_unavailable(e),
    }
}

/// GET /api/report/{cadence}/{calendar_key}
///
/// Report content, or 404 if none was generated for that key.
async fn get_report(
    State(state): State<ApiState>,
    Path((cadence, calendar_key)): Path<(String, String)>,
) -> Response {
    let cadence = match cadence.parse::<Cadence>() {
        Ok(cadence) => cadence,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match state.status.get_report(cadence, &calendar_key).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "report not found"),
        Err(e) => store_unavailable(e),
    }
}
