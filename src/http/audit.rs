//! Audit query and statistics handlers.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::model::{AuditEvent, Decision};
use crate::store::{AuditFilter, AuditStats};

use super::{ApiError, AppState};

/// Hard cap on a single page of audit results.
const MAX_LIMIT: i64 = 1000;
/// Default page size.
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters shared by the audit endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditParams {
    /// Inclusive window start.
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive window end.
    pub end_date: Option<DateTime<Utc>>,
    /// Caller team filter.
    pub team: Option<String>,
    /// Server canonical id filter.
    pub server_canonical_id: Option<String>,
    /// Tool name filter.
    pub tool_name: Option<String>,
    /// Decision filter (e.g. `DeniedToolDenylisted`).
    pub decision: Option<String>,
    /// Actor filter.
    pub actor: Option<String>,
    /// Page size; capped at 1000.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

impl AuditParams {
    fn filter(&self) -> Result<AuditFilter, GatewayError> {
        let decision = self
            .decision
            .as_deref()
            .map(|raw| {
                serde_json::from_value::<Decision>(serde_json::Value::String(raw.to_owned()))
                    .map_err(|_| GatewayError::InvalidArgument(format!("unknown decision {raw:?}")))
            })
            .transpose()?;
        Ok(AuditFilter {
            start: self.start_date,
            end: self.end_date,
            team: self.team.clone(),
            server_canonical_id: self.server_canonical_id.clone(),
            tool_name: self.tool_name.clone(),
            decision,
            actor: self.actor.clone(),
        })
    }
}

/// Response body for `GET /registry/audit`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    /// Page of matching events, newest first.
    pub events: Vec<AuditEvent>,
    /// Total matches ignoring pagination.
    pub total: i64,
    /// Effective page size.
    pub limit: i64,
    /// Effective offset.
    pub offset: i64,
}

/// `GET /registry/audit`
pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<AuditResponse>, ApiError> {
    let filter = params.filter()?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    let page = state
        .audit_store
        .query(&filter, limit, offset)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(AuditResponse {
        events: page.events,
        total: page.total,
        limit,
        offset,
    }))
}

/// `GET /registry/audit/stats`
pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<AuditStats>, ApiError> {
    let filter = params.filter()?;
    let stats = state
        .audit_store
        .stats(&filter)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(stats))
}
