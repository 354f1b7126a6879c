//! Registry endpoint handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{Approval, Principal, Scan, Server, ServerStatus};
use crate::registry::{DecisionRequest, LocalScanUpload, RegisterRequest, UpdateRequest};

use super::{ApiError, AppState};

/// Query parameters accepted by the list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Restrict to one lifecycle state (e.g. `Approved`).
    pub status: Option<String>,
    /// Restrict to one owning team.
    pub owner: Option<String>,
}

fn parse_status(raw: &str) -> Result<ServerStatus, GatewayError> {
    serde_json::from_value(serde_json::Value::String(raw.to_owned()))
        .map_err(|_| GatewayError::InvalidArgument(format!("unknown status {raw:?}")))
}

/// `POST /registry/servers`
pub async fn register(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Server>), ApiError> {
    let server = state.registry.register(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

/// `GET /registry/servers`
pub async fn list(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Server>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(ApiError::from)?;
    let servers = state
        .registry
        .list(&principal, status, params.owner.as_deref())
        .await?;
    Ok(Json(servers))
}

/// `GET /registry/servers/{id}`
pub async fn get(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Server>, ApiError> {
    let server = state
        .registry
        .get(&principal, id)
        .await?
        .ok_or(GatewayError::NotFound)?;
    Ok(Json(server))
}

/// `GET /registry/servers/by-canonical-id/{canonical_id}`
pub async fn get_by_canonical_id(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(canonical_id): Path<String>,
) -> Result<Json<Server>, ApiError> {
    let server = state
        .registry
        .get_by_canonical_id(&principal, &canonical_id)
        .await?
        .ok_or(GatewayError::NotFound)?;
    Ok(Json(server))
}

/// `PUT /registry/servers/{id}`
pub async fn update(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<Server>, ApiError> {
    let server = state.registry.update(&principal, id, req).await?;
    Ok(Json(server))
}

/// `DELETE /registry/servers/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /registry/servers/{id}/scan`
pub async fn submit_scan(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Scan>), ApiError> {
    let scan = state.registry.submit_for_scan(&principal, id).await?;
    Ok((StatusCode::ACCEPTED, Json(scan)))
}

/// `POST /registry/servers/{id}/scan/upload`
pub async fn upload_scan(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocalScanUpload>,
) -> Result<Json<Scan>, ApiError> {
    let scan = state
        .registry
        .upload_local_scan(&principal, id, payload)
        .await?;
    Ok(Json(scan))
}

/// `GET /registry/servers/{id}/scans`
pub async fn scan_history(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Scan>>, ApiError> {
    Ok(Json(state.registry.scan_history(&principal, id).await?))
}

/// `GET /registry/servers/{id}/scans/{scan_id}`
pub async fn scan_detail(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, scan_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Scan>, ApiError> {
    Ok(Json(
        state.registry.scan_detail(&principal, id, scan_id).await?,
    ))
}

/// `GET /registry/servers/{id}/scan/latest`
pub async fn latest_scan(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Scan>, ApiError> {
    Ok(Json(state.registry.latest_scan(&principal, id).await?))
}

/// `POST /registry/servers/{id}/scans/{scan_id}/cancel`
pub async fn cancel_scan(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, scan_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Scan>, ApiError> {
    Ok(Json(
        state.registry.cancel_scan(&principal, id, scan_id).await?,
    ))
}

/// `POST /registry/servers/{id}/approve`
pub async fn approve(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Approval>, ApiError> {
    Ok(Json(state.registry.approve(&principal, id, req).await?))
}

/// `POST /registry/servers/{id}/deny`
pub async fn deny(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Approval>, ApiError> {
    Ok(Json(state.registry.deny(&principal, id, req).await?))
}

/// `POST /registry/servers/{id}/suspend`
pub async fn suspend(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Approval>, ApiError> {
    Ok(Json(state.registry.suspend(&principal, id, req).await?))
}

/// `POST /registry/servers/{id}/reinstate`
pub async fn reinstate(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Approval>, ApiError> {
    Ok(Json(state.registry.reinstate(&principal, id, req).await?))
}

/// `GET /registry/servers/{id}/approvals`
pub async fn approval_history(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Approval>>, ApiError> {
    Ok(Json(
        state.registry.approval_history(&principal, id).await?,
    ))
}
