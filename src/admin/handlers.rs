use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{mask_token, ManagerError, Platform};
use crate::http::server::AppState;
use crate::resilience::BackendStatus;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub total_backends: usize,
    pub enabled_backends: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BackendSummary {
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub model: Option<String>,
    pub platform: Platform,
    pub token_masked: String,
}

#[derive(Debug, Serialize)]
pub struct BackendList<T> {
    pub backends: Vec<T>,
    pub count: usize,
}

impl<T> From<Vec<T>> for BackendList<T> {
    fn from(backends: Vec<T>) -> Self {
        Self {
            count: backends.len(),
            backends,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToggleResult {
    pub status: &'static str,
    pub message: String,
    pub backend: String,
    pub enabled: bool,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let config = state.config.snapshot();
    let enabled = config.enabled_backends();
    let (code, status) = if enabled > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthReport {
            status,
            total_backends: config.backends.len(),
            enabled_backends: enabled,
            timestamp: Utc::now(),
        }),
    )
}

pub async fn list_backends(State(state): State<AppState>) -> Json<BackendList<BackendSummary>> {
    let config = state.config.snapshot();
    let backends: Vec<BackendSummary> = config
        .backends
        .iter()
        .map(|b| BackendSummary {
            name: b.name.clone(),
            base_url: b.base_url.clone(),
            enabled: b.enabled,
            model: b.model.clone(),
            platform: b.platform,
            token_masked: mask_token(&b.token),
        })
        .collect();
    Json(backends.into())
}

pub async fn backends_status(State(state): State<AppState>) -> Json<BackendList<BackendStatus>> {
    Json(state.breaker.status().into())
}

pub async fn enable_backend(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    toggle(&state, &name, true).await
}

pub async fn disable_backend(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    toggle(&state, &name, false).await
}

async fn toggle(state: &AppState, name: &str, enabled: bool) -> Response {
    let manager = state.config.clone();
    let breaker = state.breaker.clone();
    let owned = name.to_string();
    // The breaker follows the persisted flag under the manager's write lock.
    let result = tokio::task::spawn_blocking(move || {
        manager.set_backend_enabled_with(&owned, enabled, |_| {
            breaker.set_enabled(&owned, enabled);
        })
    })
    .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(backend = %name, error = %e, "Config update task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    match outcome {
        Ok(_) => {
            let verb = if enabled { "enabled" } else { "disabled" };
            tracing::info!(backend = %name, enabled, "Backend toggled via management API");
            Json(ToggleResult {
                status: "ok",
                message: format!("backend '{name}' {verb}"),
                backend: name.to_string(),
                enabled,
            })
            .into_response()
        }
        Err(e) => {
            let code = match &e {
                ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
                ManagerError::AlreadyInState { .. } => StatusCode::CONFLICT,
                ManagerError::Persist { .. } | ManagerError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if code.is_server_error() {
                tracing::error!(backend = %name, error = %e, "Backend toggle failed");
            }
            error_response(code, e.to_string())
        }
    }
}

fn error_response(code: StatusCode, message: String) -> Response {
    (code, Json(serde_json::json!({ "error": message }))).into_response()
}
