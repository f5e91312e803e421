//! HTTP handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use leadsync_core::parse_notification;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health).post(webhook))
        .route("/health", get(health))
        .route("/webhook/amocrm", post(webhook))
        .route("/oauth/exchange", post(oauth_exchange))
        .route("/oauth/url", get(oauth_url))
        .route("/admin/rotate", post(rotate))
        .route("/structure", get(structure))
        .route("/leads/custom_fields", get(custom_fields))
        .route("/leads/{id}", get(lead))
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tracked": state.engine.state().tracked_count(),
    }))
}

// =============================================================================
// Webhook
// =============================================================================

/// Normalizes the notification and runs it through the push path.
async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let notification = parse_notification(&body, content_type).map_err(|e| {
        warn!(error = %e, content_type, bytes = body.len(), "Rejected webhook body");
        ApiError::from(e)
    })?;

    let outcome = state.engine.push_notification(&notification).await?;
    let mut response =
        serde_json::to_value(&outcome).map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Value::Object(map) = &mut response {
        map.insert("status".into(), json!("ok"));
    }
    Ok(Json(response))
}

// =============================================================================
// OAuth
// =============================================================================

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_url: Option<String>,
}

async fn oauth_exchange(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<Value>, ApiError> {
    let value = request
        .code
        .or(request.redirect_url)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("either 'code' or 'redirect_url' is required".into()))?;

    state.crm.tokens().exchange_code(&value).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn oauth_url(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let url = state.crm.tokens().authorization_url()?;
    Ok(Json(json!({ "url": url.as_str() })))
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct RotateRequest {
    #[serde(default)]
    archive_name: Option<String>,
}

/// Body is optional; without a name the archive is called `Archive YYYY-MM`.
async fn rotate(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: RotateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RotateRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    };

    let archive = state
        .engine
        .rotate_archive(request.archive_name.as_deref())
        .await?;
    info!(archive = %archive, "Active sheet archived");
    Ok(Json(json!({ "status": "ok", "archive": archive })))
}

// =============================================================================
// CRM Passthrough
// =============================================================================

async fn structure(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.crm.get_raw("/api/v4/leads/pipelines?with=statuses").await?))
}

async fn custom_fields(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.crm.get_raw("/api/v4/leads/custom_fields").await?))
}

async fn lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let path = format!("/api/v4/leads/{}?with=contacts,companies", id);
    Ok(Json(state.crm.get_raw(&path).await?))
}

// =============================================================================
// Tests
// =============================================================================
