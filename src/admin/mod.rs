//! Management API served on the proxy listener.
//!
//! `/health` is always open. Every other route requires
//! `Authorization: Bearer <admin.api_key>` when a key is configured.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/backends", get(list_backends))
        .route("/backends/status", get(backends_status))
        .route("/backend/{name}/enable", get(enable_backend).post(enable_backend))
        .route("/backend/{name}/disable", get(disable_backend).post(disable_backend))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware));

    Router::new().route("/health", get(health)).merge(protected)
}
