//! # HTTP API
//!
//! JSON API for CI and CLI clients, plus metrics and health probes.
//!
//! Endpoints:
//! - `POST /api/artifact`, `GET /api/artifacts` - artifact ingest and listing
//! - `POST /api/releases`, `GET /api/releases` - release requests and history
//! - `POST /api/rollback` - rollback requests
//! - `GET /api/status` - current release of every app in an env
//! - `GET /api/track` - processing status of a request by event id
//! - `POST /api/flux-events` - reconciler status callbacks
//! - user management (admin scope)
//! - `/metrics`, `/healthz`, `/readyz`
//!
//! Requests are authenticated with a bearer token resolved against the
//! stored user secrets. HTTP handlers only write to the event store and
//! return; the gitops repository is never touched from here.

mod artifacts;
mod flux;
mod releases;
mod users;

pub use flux::filter_reconcile_message;

use axum::extract::{FromRequestParts, State};
use axum::http::{request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::git::RepoCache;
use crate::model::User;
use crate::notifications::NotificationsManager;
use crate::store::Store;

const REQUEST_TIMEOUT_SECONDS: u64 = 60;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub repo_cache: Option<Arc<RepoCache>>,
    pub notifications: Arc<NotificationsManager>,
    pub gitops_repo: String,
    pub is_ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("gitops_repo", &self.gitops_repo)
            .finish_non_exhaustive()
    }
}

/// Error shape every handler returns: the status code plus a plain-text
/// description, mirroring `http.Error` semantics.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> ApiError {
        ApiError(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn not_found() -> ApiError {
        ApiError(StatusCode::NOT_FOUND, "Not Found".to_string())
    }

    pub fn internal(error: impl std::fmt::Display) -> ApiError {
        error!("internal error: {}", error);
        ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

/// Bearer-token authenticated user.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

impl FromRequestParts<ApiState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError(
                StatusCode::UNAUTHORIZED,
                "Unauthorized".to_string(),
            ))?;

        let user = state
            .store
            .user_by_secret(token)
            .map_err(ApiError::internal)?
            .ok_or(ApiError(
                StatusCode::UNAUTHORIZED,
                "Unauthorized".to_string(),
            ))?;

        Ok(AuthenticatedUser(user))
    }
}

/// Admin-scoped user, for user management endpoints.
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

impl FromRequestParts<ApiState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let AuthenticatedUser(user) =
            AuthenticatedUser::from_request_parts(parts, state).await?;
        if !user.admin {
            return Err(ApiError(StatusCode::FORBIDDEN, "Forbidden".to_string()));
        }
        Ok(AdminUser(user))
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/artifact", post(artifacts::save_artifact))
        .route("/api/artifacts", get(artifacts::get_artifacts))
        .route(
            "/api/releases",
            post(releases::release).get(releases::get_releases),
        )
        .route("/api/rollback", post(releases::rollback))
        .route("/api/status", get(releases::get_status))
        .route("/api/track", get(releases::track))
        .route("/api/flux-events", post(flux::flux_event))
        .route(
            "/api/user/{login}",
            get(users::get_user).delete(users::delete_user),
        )
        .route("/api/user", post(users::save_user))
        .route("/api/users", get(users::get_users))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(
            REQUEST_TIMEOUT_SECONDS,
        )))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(port: u16, state: ApiState) -> Result<(), anyhow::Error> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn gather() -> Vec<prometheus::proto::MetricFamily> {
    use crate::observability::metrics::REGISTRY;
    REGISTRY.gather()
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<ApiState>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub const TEST_TOKEN: &str = "test-token";
    pub const ADMIN_TOKEN: &str = "admin-token";

    /// A router over an in-memory store with one regular and one admin
    /// user, no repo cache.
    pub fn test_router() -> (Router, Store, Arc<NotificationsManager>) {
        let store = Store::new_in_memory().unwrap();
        store
            .create_user(&User {
                login: "ci".to_string(),
                secret: TEST_TOKEN.to_string(),
                admin: false,
                ..Default::default()
            })
            .unwrap();
        store
            .create_user(&User {
                login: "admin".to_string(),
                secret: ADMIN_TOKEN.to_string(),
                admin: true,
                ..Default::default()
            })
            .unwrap();

        let notifications = Arc::new(NotificationsManager::new());
        let state = ApiState {
            store: store.clone(),
            repo_cache: None,
            notifications: Arc::clone(&notifications),
            gitops_repo: "acme/gitops".to_string(),
            is_ready: Arc::new(AtomicBool::new(true)),
        };
        (router(state), store, notifications)
    }
}
