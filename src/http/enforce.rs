//! Enforcement adapter for proxied MCP traffic.
//!
//! Middleware over the configured proxy paths. It extracts the target server
//! and tool from the request, asks the policy engine for a verdict, blocks
//! or forwards per the enforcement mode, and hands an audit event to the
//! pipeline without awaiting persistence. Internal errors fail closed in
//! Enforce mode and open in Audit mode.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EnforcementMode, PolicyConfig};
use crate::model::{AuditEvent, Decision, Principal};
use crate::policy::PolicyVerdict;

use super::AppState;

/// Window for the per-user and per-team rate limits.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Structured body returned on an enforced denial.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DenyBody {
    error: &'static str,
    reason: String,
    decision: &'static str,
    server_canonical_id: String,
    tool_name: String,
    trace_id: String,
}

/// Sliding-window rate limiters keyed by principal and team.
///
/// The critical section is short and has no awaits, so a sync [`Mutex`]
/// suffices. A limit of zero disables the corresponding check.
pub struct RateLimiters {
    per_user: u32,
    per_team: u32,
    users: Mutex<HashMap<String, VecDeque<Instant>>>,
    teams: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiters {
    /// Build limiters from the policy configuration.
    pub fn new(policy: &PolicyConfig) -> Self {
        Self {
            per_user: policy.rate_limit_per_user,
            per_team: policy.rate_limit_per_team,
            users: Mutex::new(HashMap::new()),
            teams: Mutex::new(HashMap::new()),
        }
    }

    /// Record and check one call for a principal.
    pub fn allow_user(&self, id: &str) -> bool {
        Self::check(&self.users, id, self.per_user)
    }

    /// Record and check one call for a team.
    pub fn allow_team(&self, team: &str) -> bool {
        Self::check(&self.teams, team, self.per_team)
    }

    fn check(map: &Mutex<HashMap<String, VecDeque<Instant>>>, key: &str, max: u32) -> bool {
        if max == 0 {
            return true;
        }
        let Ok(mut map) = map.lock() else {
            return true;
        };
        let window = map.entry(key.to_owned()).or_default();
        let cutoff = Instant::now()
            .checked_sub(RATE_WINDOW)
            .unwrap_or_else(Instant::now);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        if window.len() >= max as usize {
            return false;
        }
        window.push_back(Instant::now());
        true
    }
}

/// Whether enforcement applies to this path.
fn is_enforced_path(path: &str) -> bool {
    path.contains("/adapters/") || path.contains("/tools/") || path.ends_with("/mcp")
}

/// Canonical id from the path segment following `adapters/`.
fn canonical_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "adapters" {
            return segments.next().map(ToOwned::to_owned);
        }
    }
    None
}

/// Tool name from the JSON-RPC body: `params.name` for `tools/call`,
/// otherwise the `method` itself.
fn tool_from_body(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let method = value.get("method")?.as_str()?;
    if method == "tools/call" {
        if let Some(name) = value
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
        {
            return Some(name.to_owned());
        }
    }
    Some(method.to_owned())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

fn response_size(response: &Response) -> i64 {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// The enforcement middleware.
pub async fn enforce(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.gateway.enabled {
        return next.run(req).await;
    }
    let path = req.uri().path().to_owned();
    if !is_enforced_path(&path) {
        return next.run(req).await;
    }
    let Some(canonical_id) = canonical_id_from_path(&path) else {
        debug!(path = %path, "no server segment on enforced path, bypassing");
        return next.run(req).await;
    };

    let principal = req
        .extensions()
        .get::<Principal>()
        .cloned()
        .unwrap_or_else(Principal::anonymous);
    let trace_id = header_string(req.headers(), "x-trace-id")
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let source_ip = header_string(req.headers(), "x-forwarded-for");
    let user_agent = header_string(req.headers(), "user-agent");
    let mode = state.config.gateway.enforcement_mode;
    let started = Instant::now();

    // Buffer a bounded prefix of the body so it can be replayed downstream.
    let (parts, body) = req.into_parts();
    let max_bytes = state.config.policy.max_request_payload_bytes;
    let bytes = match axum::body::to_bytes(body, max_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            // The refused body cannot be replayed, so an oversized payload is
            // blocked in either mode.
            let ctx = EventContext {
                principal: &principal,
                canonical_id: &canonical_id,
                tool_name: "unknown",
                trace_id: &trace_id,
                source_ip: source_ip.as_deref(),
                user_agent: user_agent.as_deref(),
                request_size: max_bytes as i64,
                response_size: 0,
                started,
                risk: None,
            };
            record(&state, &ctx, Decision::DeniedPayloadTooLarge, Some("request payload exceeds the configured bound".to_owned()));
            return deny_response(
                &canonical_id,
                "unknown",
                &trace_id,
                Decision::DeniedPayloadTooLarge,
                "request payload exceeds the configured bound".to_owned(),
            );
        }
    };

    let Some(tool_name) = tool_from_body(&bytes) else {
        debug!(path = %path, "tool name unrecoverable from body, bypassing");
        let req = Request::from_parts(parts, Body::from(bytes));
        return next.run(req).await;
    };

    let request_size = bytes.len() as i64;
    let mut ctx = EventContext {
        principal: &principal,
        canonical_id: &canonical_id,
        tool_name: &tool_name,
        trace_id: &trace_id,
        source_ip: source_ip.as_deref(),
        user_agent: user_agent.as_deref(),
        request_size,
        response_size: 0,
        started,
        risk: None,
    };

    // Rate limits sit in front of the decision function.
    let over_user = !state.limiters.allow_user(&principal.id);
    let over_team = principal
        .team
        .as_deref()
        .is_some_and(|team| !state.limiters.allow_team(team));
    if over_user || over_team {
        let reason = if over_user {
            format!("principal {} exceeded the per-user rate limit", principal.id)
        } else {
            "team exceeded the per-team rate limit".to_owned()
        };
        return finish_denied(
            &state,
            ctx,
            mode,
            parts,
            bytes,
            next,
            Decision::DeniedRateLimited,
            reason,
        )
        .await;
    }

    let decide_started = Instant::now();
    let verdict = state
        .policy
        .decide(&principal, &canonical_id, &tool_name)
        .await;
    state
        .metrics
        .observe_policy_latency(decide_started.elapsed().as_secs_f64());

    match verdict {
        Ok(PolicyVerdict {
            decision: Decision::Allowed,
            server_risk_score,
            ..
        }) => {
            ctx.risk = server_risk_score;
            let req = Request::from_parts(parts, Body::from(bytes));
            let deadline = Duration::from_millis(state.config.policy.default_timeout_ms.max(1));
            let response = match tokio::time::timeout(deadline, next.run(req)).await {
                Ok(response) => response,
                Err(_) => {
                    record(
                        &state,
                        &ctx,
                        Decision::TimedOut,
                        Some(format!("downstream exceeded {}ms", deadline.as_millis())),
                    );
                    return (
                        StatusCode::GATEWAY_TIMEOUT,
                        Json(serde_json::json!({
                            "error": "downstream timeout",
                            "traceId": trace_id,
                        })),
                    )
                        .into_response();
                }
            };
            ctx.response_size = response_size(&response);
            state.metrics.observe_tool_call_latency(
                &canonical_id,
                &tool_name,
                started.elapsed().as_secs_f64(),
            );
            record(&state, &ctx, Decision::Allowed, None);
            response
        }
        Ok(verdict) => {
            ctx.risk = verdict.server_risk_score;
            let reason = verdict.reason.unwrap_or_default();
            finish_denied(&state, ctx, mode, parts, bytes, next, verdict.decision, reason).await
        }
        Err(e) => {
            warn!(error = %e, server = %canonical_id, "policy decision failed");
            record(&state, &ctx, Decision::Error, Some(e.to_string()));
            match mode {
                EnforcementMode::Enforce => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "policy_unavailable",
                        "traceId": trace_id,
                    })),
                )
                    .into_response(),
                EnforcementMode::Audit => {
                    let req = Request::from_parts(parts, Body::from(bytes));
                    next.run(req).await
                }
            }
        }
    }
}

/// Per-request context carried into audit recording.
struct EventContext<'a> {
    principal: &'a Principal,
    canonical_id: &'a str,
    tool_name: &'a str,
    trace_id: &'a str,
    source_ip: Option<&'a str>,
    user_agent: Option<&'a str>,
    request_size: i64,
    response_size: i64,
    started: Instant,
    risk: Option<f64>,
}

#[allow(clippy::too_many_arguments)]
async fn finish_denied(
    state: &AppState,
    mut ctx: EventContext<'_>,
    mode: EnforcementMode,
    parts: axum::http::request::Parts,
    bytes: axum::body::Bytes,
    next: Next,
    decision: Decision,
    reason: String,
) -> Response {
    match mode {
        EnforcementMode::Enforce => {
            record(state, &ctx, decision, Some(reason.clone()));
            deny_response(ctx.canonical_id, ctx.tool_name, ctx.trace_id, decision, reason)
        }
        EnforcementMode::Audit => {
            // Audit mode still forwards; the would-deny decision is recorded.
            let req = Request::from_parts(parts, Body::from(bytes));
            let response = next.run(req).await;
            ctx.response_size = response_size(&response);
            record(state, &ctx, decision, Some(reason));
            response
        }
    }
}

fn deny_response(
    canonical_id: &str,
    tool_name: &str,
    trace_id: &str,
    decision: Decision,
    reason: String,
) -> Response {
    let body = DenyBody {
        error: "request denied by governance policy",
        reason,
        decision: decision.label(),
        server_canonical_id: canonical_id.to_owned(),
        tool_name: tool_name.to_owned(),
        trace_id: trace_id.to_owned(),
    };
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

fn record(state: &AppState, ctx: &EventContext<'_>, decision: Decision, reason: Option<String>) {
    let latency_ms = ctx.started.elapsed().as_secs_f64() * 1_000.0;
    let event = AuditEvent {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        actor: ctx.principal.id.clone(),
        actor_email: ctx.principal.email.clone(),
        team: ctx.principal.team.clone(),
        server_canonical_id: ctx.canonical_id.to_owned(),
        tool_name: ctx.tool_name.to_owned(),
        decision,
        reason,
        latency_ms,
        request_size: ctx.request_size,
        response_size: ctx.response_size,
        trace_id: Some(ctx.trace_id.to_owned()),
        source_ip: ctx.source_ip.map(ToOwned::to_owned),
        user_agent: ctx.user_agent.map(ToOwned::to_owned),
        server_risk_score: ctx.risk,
    };
    state.metrics.tool_call(
        ctx.canonical_id,
        ctx.tool_name,
        ctx.principal.team.as_deref(),
        decision,
    );
    state.pipeline.record(event);
}
