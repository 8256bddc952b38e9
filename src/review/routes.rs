//! REST endpoints for the review surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::service::ReviewService;
use crate::error::ReviewError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReviewService>,
}

/// Build the Axum router with the review REST routes.
///
/// Ticket ids are email Message-IDs and may contain `/`. Clients send the id
/// as one percent-encoded path segment (`%2F`); `Path` decodes it.
pub fn review_routes(service: Arc<ReviewService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health))
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{id}", get(get_ticket))
        .route("/api/tickets/{id}/resolve", post(resolve_ticket))
        .route("/api/tickets/{id}/draft", post(edit_draft))
        .route("/api/overview", get(overview))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for ReviewError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReviewError::NotFound(_) => StatusCode::NOT_FOUND,
            ReviewError::NotEditable { .. } => StatusCode::CONFLICT,
            ReviewError::EmptyDraft => StatusCode::BAD_REQUEST,
            ReviewError::Store(e) => {
                error!(error = %e, "Review request failed in store");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "support-triage-review"
    }))
}

// ── Tickets ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    include_resolved: bool,
}

async fn list_tickets(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ReviewError> {
    let tickets = state.service.priority_queue(params.include_resolved).await?;
    Ok(Json(tickets))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ReviewError> {
    Ok(Json(state.service.get(&id).await?))
}

async fn resolve_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ReviewError> {
    Ok(Json(state.service.resolve(&id).await?))
}

#[derive(Debug, Deserialize)]
struct DraftRequest {
    text: String,
}

async fn edit_draft(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DraftRequest>,
) -> Result<impl IntoResponse, ReviewError> {
    Ok(Json(state.service.edit_draft(&id, &body.text).await?))
}

// ── Overview ────────────────────────────────────────────────────────────

async fn overview(State(state): State<AppState>) -> Result<impl IntoResponse, ReviewError> {
    Ok(Json(state.service.overview().await?))
}
