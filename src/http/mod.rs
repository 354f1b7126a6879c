//! HTTP surface: routing, identity extraction, and error mapping.
//!
//! The registry API is JSON over axum. Identity arrives as pre-validated
//! claims in trusted proxy headers and is materialized into a [`Principal`]
//! request extension at the edge; everything below the HTTP layer is
//! transport-agnostic. Enforcement for proxied MCP traffic is a middleware
//! layer (see [`enforce`]).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::audit::AuditPipeline;
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::model::Principal;
use crate::policy::PolicyEngine;
use crate::registry::RegistryService;
use crate::store::AuditStore;

pub mod audit;
pub mod enforce;
pub mod registry;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    /// Registry lifecycle service.
    pub registry: Arc<RegistryService>,
    /// Admission decision engine.
    pub policy: Arc<PolicyEngine>,
    /// Audit store for queries and statistics.
    pub audit_store: Arc<dyn AuditStore>,
    /// Fire-and-forget audit producer.
    pub pipeline: AuditPipeline,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Sliding-window rate limiters for enforcement.
    pub limiters: Arc<enforce::RateLimiters>,
}

/// Build the service router with the enforcement layer attached.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/registry/servers",
            post(registry::register).get(registry::list),
        )
        .route(
            "/registry/servers/by-canonical-id/{canonical_id}",
            get(registry::get_by_canonical_id),
        )
        .route(
            "/registry/servers/{id}",
            get(registry::get)
                .put(registry::update)
                .delete(registry::delete),
        )
        .route("/registry/servers/{id}/scan", post(registry::submit_scan))
        .route(
            "/registry/servers/{id}/scan/upload",
            post(registry::upload_scan),
        )
        .route(
            "/registry/servers/{id}/scan/latest",
            get(registry::latest_scan),
        )
        .route("/registry/servers/{id}/scans", get(registry::scan_history))
        .route(
            "/registry/servers/{id}/scans/{scan_id}",
            get(registry::scan_detail),
        )
        .route(
            "/registry/servers/{id}/scans/{scan_id}/cancel",
            post(registry::cancel_scan),
        )
        .route("/registry/servers/{id}/approve", post(registry::approve))
        .route("/registry/servers/{id}/deny", post(registry::deny))
        .route("/registry/servers/{id}/suspend", post(registry::suspend))
        .route(
            "/registry/servers/{id}/reinstate",
            post(registry::reinstate),
        )
        .route(
            "/registry/servers/{id}/approvals",
            get(registry::approval_history),
        )
        .route("/registry/audit", get(audit::query))
        .route("/registry/audit/stats", get(audit::stats))
        .route("/policy/reload", post(reload_policy))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce::enforce,
        ))
        .layer(middleware::from_fn(identity))
        .with_state(state)
}

/// Materialize the caller's identity from trusted proxy headers.
///
/// Missing subject claims degrade to the anonymous principal; registry
/// operations reject it, enforcement records it.
pub async fn identity(
    mut req: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let principal = principal_from_headers(req.headers());
    req.extensions_mut().insert(principal);
    next.run(req).await
}

/// Parse the upstream identity headers into a [`Principal`].
pub fn principal_from_headers(headers: &HeaderMap) -> Principal {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToOwned::to_owned)
    };
    let Some(id) = header("x-auth-subject") else {
        return Principal::anonymous();
    };
    let roles = header("x-auth-roles")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();
    Principal {
        id,
        email: header("x-auth-email"),
        team: header("x-auth-team"),
        roles,
    }
}

/// JSON error body returned for every failed operation.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub error: &'static str,
    /// Human-readable detail.
    pub message: String,
}

/// [`GatewayError`] adapted to an HTTP response.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            GatewayError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            GatewayError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            GatewayError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            GatewayError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            GatewayError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            GatewayError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorBody {
            error: code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// Atomically swap the policy snapshot from the on-disk configuration.
async fn reload_policy(
    State(state): State<AppState>,
    axum::Extension(principal): axum::Extension<Principal>,
) -> Result<StatusCode, ApiError> {
    if !principal.is_admin() {
        return Err(GatewayError::Forbidden(
            "policy reload requires the admin role".to_owned(),
        )
        .into());
    }
    let fresh = Config::load()
        .map_err(|e| GatewayError::Internal(format!("config reload failed: {e}")))?;
    state.policy.reload(&fresh.policy);
    tracing::info!(actor = %principal.id, "policy snapshot reloaded");
    Ok(StatusCode::NO_CONTENT)
}
